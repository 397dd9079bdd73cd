//! Double-buffered latches between pipeline stages.
//!
//! A [`PipelineBarrier`] holds a committed value (visible through [`PipelineBarrier::read`])
//! and a staged value (set through [`PipelineBarrier::write`]).
//! Staged values only become visible after [`PipelineBarrier::commit`].
//!
//! If every stage of a clock reads its input barrier and writes its output barrier,
//! and all barriers are committed together at the end of the clock,
//! every stage observes only the values committed by the previous clock,
//! regardless of the order the stages are evaluated in.
//!
//! ```
//! use mips_ensemble::sim::barrier::PipelineBarrier;
//!
//! let mut latch = PipelineBarrier::new();
//! latch.write(5u32);
//! assert_eq!(*latch.read(), 0);
//!
//! latch.commit();
//! assert_eq!(*latch.read(), 5);
//! assert!(latch.has_value());
//!
//! // nothing written this clock
//! latch.commit();
//! assert_eq!(*latch.read(), 5);
//! assert!(!latch.has_value());
//! ```

/// A double-buffered latch.
///
/// See the [module-level documentation](self) for details.
#[derive(Debug, Clone, Default)]
pub struct PipelineBarrier<T> {
    current: T,
    next: Option<T>,
    has_value: bool,
}
impl<T: Default> PipelineBarrier<T> {
    /// Creates a barrier holding the default value, with nothing staged.
    pub fn new() -> Self {
        Self { current: T::default(), next: None, has_value: false }
    }
}
impl<T> PipelineBarrier<T> {
    /// Stages a value for the next commit.
    ///
    /// If a value was already staged, it is replaced.
    pub fn write(&mut self, value: T) {
        self.next = Some(value);
    }

    /// The last committed value (or the default value if nothing has been committed).
    pub fn read(&self) -> &T {
        &self.current
    }

    /// Publishes the staged value, if there is one.
    ///
    /// If nothing was staged, the committed value is kept and [`PipelineBarrier::has_value`] becomes false.
    pub fn commit(&mut self) {
        match self.next.take() {
            Some(v) => {
                self.current = v;
                self.has_value = true;
            },
            None => self.has_value = false,
        }
    }

    /// Whether a value is staged for the next commit.
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Whether the last commit published a value.
    pub fn has_value(&self) -> bool {
        self.has_value
    }

    /// Discards the staged value.
    pub fn cancel(&mut self) {
        self.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_invisible_until_commit() {
        let mut b = PipelineBarrier::<u32>::new();
        assert!(!b.has_value());
        assert!(!b.has_next());

        b.write(1);
        assert!(b.has_next());
        assert_eq!(*b.read(), 0);

        b.commit();
        assert!(!b.has_next());
        assert!(b.has_value());
        assert_eq!(*b.read(), 1);
    }

    #[test]
    fn test_empty_commit_keeps_value() {
        let mut b = PipelineBarrier::<u32>::new();
        b.write(7);
        b.commit();
        b.commit();
        assert!(!b.has_value());
        assert_eq!(*b.read(), 7);

        b.commit();
        assert!(!b.has_value());
        assert_eq!(*b.read(), 7);
    }

    #[test]
    fn test_last_write_wins() {
        let mut b = PipelineBarrier::<&str>::new();
        b.write("first");
        b.write("second");
        b.commit();
        assert_eq!(*b.read(), "second");

        b.write("dropped");
        b.cancel();
        b.commit();
        assert_eq!(*b.read(), "second");
        assert!(!b.has_value());
    }
}
