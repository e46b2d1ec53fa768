use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use time::OffsetDateTime;

/// A payload moving through the pipeline, stamped with the instant it was
/// fetched from the portal.
#[derive(Debug, Clone)]
pub struct Record<T> {
    pub payload: T,
    pub fetched_at: OffsetDateTime,
}

impl<T> Record<T> {
    pub fn now(payload: T) -> Self {
        Self {
            payload,
            fetched_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("validation rejected record: {0}")]
    Validation(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type RecordStream<T> = Pin<Box<dyn Stream<Item = Result<Record<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> RecordStream<T>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Record<T>, PipelineError>> + Send + Unpin + 'static;
}

/// Pure per-record validation between source and sink. A rejection turns
/// the record into a `PipelineError::Validation` item; it never aborts the
/// stream.
pub trait Validate<T>: Send + Sync {
    fn check(&self, payload: &T) -> Result<(), String>;
}

pub struct Pipeline<S, T, K> {
    pub source: S,
    pub validator: Option<Arc<dyn Validate<T>>>,
    pub sink: K,
}

impl<T, S, K> Pipeline<S, T, K>
where
    T: Send + 'static,
    S: Source<T> + Send + Sync + 'static,
    K: Sink<T> + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<(), PipelineError> {
        let mut stream = self.source.stream().await;

        if let Some(validator) = self.validator {
            stream = Box::pin(stream.map(move |item| match item {
                Ok(record) => match validator.check(&record.payload) {
                    Ok(()) => Ok(record),
                    Err(reason) => Err(PipelineError::Validation(reason)),
                },
                Err(e) => Err(e),
            }));
        }

        self.sink.run(stream).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct VecSource(Vec<i64>);

    #[async_trait::async_trait]
    impl Source<i64> for VecSource {
        async fn stream(&self) -> RecordStream<i64> {
            let records: Vec<_> = self.0.iter().map(|v| Ok(Record::now(*v))).collect();
            Box::pin(futures::stream::iter(records))
        }
    }

    struct CollectSink {
        values: Arc<Mutex<Vec<i64>>>,
        rejected: Arc<Mutex<usize>>,
    }

    #[async_trait::async_trait]
    impl Sink<i64> for CollectSink {
        async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
        where
            S: Stream<Item = Result<Record<i64>, PipelineError>> + Send + Unpin + 'static,
        {
            while let Some(item) = input.next().await {
                match item {
                    Ok(record) => self.values.lock().unwrap().push(record.payload),
                    Err(_) => *self.rejected.lock().unwrap() += 1,
                }
            }
            Ok(())
        }
    }

    struct NonNegative;

    impl Validate<i64> for NonNegative {
        fn check(&self, value: &i64) -> Result<(), String> {
            if *value < 0 {
                Err(format!("negative value {value}"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn validator_rejects_records_without_stopping_the_stream() {
        let values = Arc::new(Mutex::new(Vec::new()));
        let rejected = Arc::new(Mutex::new(0));

        let pipeline = Pipeline {
            source: VecSource(vec![1, -2, 3]),
            validator: Some(Arc::new(NonNegative)),
            sink: CollectSink {
                values: values.clone(),
                rejected: rejected.clone(),
            },
        };
        pipeline.run().await.unwrap();

        assert_eq!(*values.lock().unwrap(), vec![1, 3]);
        assert_eq!(*rejected.lock().unwrap(), 1);
    }
}
