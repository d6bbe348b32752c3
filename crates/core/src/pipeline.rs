//! Interception pipeline: ordered cross-cutting wrappers around a handler.
//!
//! Interceptors are registered once and composed so that the first one
//! registered is the outermost. The innermost link is the terminal
//! [`Handler`]: the broker write on the publish path, the user handler on the
//! consume path.

use async_trait::async_trait;
use std::sync::Arc;

use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::handler::Handler;

/// A cross-cutting concern wrapped around a publish or handle call.
///
/// Implementations either call `next.run(ctx, envelope)` (observing or
/// replacing its result) or short-circuit by returning their own result.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn intercept(&self, ctx: &Context, envelope: &Envelope, next: Next<'_>) -> Result<()>;
}

/// The remainder of the chain handed to an interceptor.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    terminal: &'a dyn Handler,
}

impl<'a> Next<'a> {
    /// Invoke the rest of the chain.
    pub async fn run(self, ctx: &Context, envelope: &Envelope) -> Result<()> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    terminal: self.terminal,
                };
                head.intercept(ctx, envelope, next).await
            }
            None => self.terminal.handle(ctx, envelope).await,
        }
    }
}

/// An immutable, ordered list of interceptors.
///
/// Cloning shares the underlying list, so a pipeline snapshot can be taken
/// cheaply for every call.
#[derive(Clone, Default)]
pub struct Pipeline {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl Pipeline {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    /// A new pipeline with `interceptor` appended (innermost so far).
    pub fn with(&self, interceptor: Arc<dyn Interceptor>) -> Self {
        let mut list: Vec<Arc<dyn Interceptor>> = self.interceptors.iter().cloned().collect();
        list.push(interceptor);
        Self::new(list)
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Names in registration order (outermost first).
    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    /// Run `envelope` through every interceptor and then `terminal`.
    pub async fn execute(
        &self,
        ctx: &Context,
        envelope: &Envelope,
        terminal: &dyn Handler,
    ) -> Result<()> {
        let next = Next {
            chain: &self.interceptors,
            terminal,
        };
        next.run(ctx, envelope).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("interceptors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClassifiedError, Error};
    use std::sync::Mutex;

    /// Records the order in which links run.
    struct Recording {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        async fn intercept(&self, ctx: &Context, envelope: &Envelope, next: Next<'_>) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            let result = next.run(ctx, envelope).await;
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            result
        }
    }

    /// Rejects everything without calling the rest of the chain.
    struct Gate;

    #[async_trait]
    impl Interceptor for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn intercept(&self, _ctx: &Context, _envelope: &Envelope, _next: Next<'_>) -> Result<()> {
            Err(Error::Handler(ClassifiedError::business("blocked by gate")))
        }
    }

    struct Terminal {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Handler for Terminal {
        async fn handle(&self, _ctx: &Context, _envelope: &Envelope) -> Result<()> {
            self.log.lock().unwrap().push("terminal".into());
            Ok(())
        }
    }

    fn recording(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Interceptor> {
        Arc::new(Recording {
            name: name.into(),
            log: log.clone(),
        })
    }

    #[tokio::test]
    async fn first_registered_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![recording("a", &log), recording("b", &log)]);
        let terminal = Terminal { log: log.clone() };

        pipeline
            .execute(&Context::new(), &Envelope::new("k", b"x".to_vec()), &terminal)
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:before", "b:before", "terminal", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![recording("a", &log)]).with(Arc::new(Gate));
        let terminal = Terminal { log: log.clone() };

        let err = pipeline
            .execute(&Context::new(), &Envelope::new("k", b"x".to_vec()), &terminal)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("blocked by gate"));
        assert_eq!(*log.lock().unwrap(), vec!["a:before", "a:after"]);
    }

    #[tokio::test]
    async fn empty_pipeline_calls_terminal_directly() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let terminal = Terminal { log: log.clone() };
        Pipeline::default()
            .execute(&Context::new(), &Envelope::new("k", b"x".to_vec()), &terminal)
            .await
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["terminal"]);
    }

    #[test]
    fn with_appends_without_touching_original() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let base = Pipeline::new(vec![recording("a", &log)]);
        let extended = base.with(Arc::new(Gate));
        assert_eq!(base.names(), vec!["a"]);
        assert_eq!(extended.names(), vec!["a", "gate"]);
    }
}
