use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::worker::{NodeProcessor, StreamData};

use super::Graph;

type MapFn<T, U> = Box<dyn Fn(T) -> Option<U> + Send + Sync>;

/// Successor that re-types a message and starts another graph with it.
pub struct GraphBridge<T, U> {
    target: Arc<Graph<U>>,
    map: MapFn<T, U>,
}

impl<T, U> GraphBridge<T, U> {
    pub fn new<F>(target: Arc<Graph<U>>, map: F) -> Self
    where
        F: Fn(T) -> Option<U> + Send + Sync + 'static,
    {
        Self {
            target,
            map: Box::new(map),
        }
    }
}

#[async_trait]
impl<T, U> NodeProcessor<T> for GraphBridge<T, U>
where
    T: Send + 'static,
    U: StreamData,
{
    fn name(&self) -> &str {
        "bridge"
    }

    async fn process(&self, message: T) -> Result<()> {
        match (self.map)(message) {
            Some(mapped) => self.target.start(mapped).await,
            None => Ok(()),
        }
    }
}
