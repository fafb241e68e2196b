//! Stock processors.

use std::marker::PhantomData;

use super::{ItemError, ItemProcessor};

/// Returns every item unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughItemProcessor;

impl<T: Send> ItemProcessor<T, T> for PassThroughItemProcessor {
    fn process(&self, item: T) -> Result<Option<T>, ItemError> {
        Ok(Some(item))
    }
}

/// Processor backed by a closure.
pub struct FnItemProcessor<I, O, F> {
    f: F,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<I, O, F> FnItemProcessor<I, O, F>
where
    F: Fn(I) -> Result<Option<O>, ItemError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

impl<I, O, F> ItemProcessor<I, O> for FnItemProcessor<I, O, F>
where
    F: Fn(I) -> Result<Option<O>, ItemError> + Send + Sync,
{
    fn process(&self, item: I) -> Result<Option<O>, ItemError> {
        (self.f)(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closure_can_filter_and_fail() {
        let processor = FnItemProcessor::new(|n: i32| match n {
            n if n < 0 => Err(ItemError::validation("negative")),
            0 => Ok(None),
            n => Ok(Some(n * 10)),
        });

        assert_eq!(processor.process(2).unwrap(), Some(20));
        assert_eq!(processor.process(0).unwrap(), None);
        assert!(matches!(processor.process(-1), Err(ItemError::Validation(_))));
    }
}
