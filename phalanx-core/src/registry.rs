//! The per-worker method table.
//!
//! Every function a worker serves is an entry keyed by its wire method id,
//! holding a type-erased triple of input decoder, handler, and output
//! encoder. Registration is typed — the [`RpcFunction`] signature fixes the
//! codecs — and dispatch is dynamic, so the server loop can route arbitrary
//! requests without knowing their schemas.

use std::{collections::HashMap, sync::Arc};

use futures::future::BoxFuture;
use tracing::instrument;

use crate::{
    error::WireFailure,
    serializer::Serializer,
    service::{CallContext, RpcFunction, WorkerService},
};

type HandlerFuture = BoxFuture<'static, Result<Vec<u8>, WireFailure>>;
type Handler<S> = Arc<dyn Fn(CallContext<S>, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Method id → (decode input, handler, encode output), fixed at worker
/// bootstrap.
pub struct FunctionRegistry<S: WorkerService> {
    entries: HashMap<&'static str, Handler<S>>,
    serializer: Serializer,
}

impl<S: WorkerService> FunctionRegistry<S> {
    pub(crate) fn new(serializer: Serializer) -> Self {
        Self {
            entries: HashMap::new(),
            serializer,
        }
    }

    pub(crate) fn collect(serializer: Serializer) -> Self {
        let mut registry = Self::new(serializer);
        S::functions(&mut registry);
        registry
    }

    /// Bind a handler to a function signature.
    ///
    /// The handler receives the decoded input and the call context; its
    /// output is encoded against the signature's output schema before it is
    /// sent back.
    pub fn register<F, H, Fut>(&mut self, handler: H)
    where
        F: RpcFunction,
        H: Fn(CallContext<S>, F::Input) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<F::Output>> + Send + 'static,
    {
        let serializer = self.serializer;
        let handler = Arc::new(handler);
        let entry: Handler<S> = Arc::new(move |ctx, payload| {
            let handler = handler.clone();
            Box::pin(async move {
                let input: F::Input = serializer
                    .from_bytes(&payload)
                    .map_err(|err| WireFailure::Codec(format!("{err:#}")))?;
                let output = handler.as_ref()(ctx, input)
                    .await
                    .map_err(|err| WireFailure::Handler(format!("{err:#}")))?;
                serializer
                    .to_bytes(&output)
                    .map_err(|err| WireFailure::Codec(format!("{err:#}")))
            })
        });

        let previous = self.entries.insert(F::NAME, entry);
        assert!(
            previous.is_none(),
            "rpc function {:?} registered twice",
            F::NAME
        );
    }

    /// Route a request to its handler, or report the unknown method.
    #[instrument(skip_all, fields(method = %method), level = "debug")]
    pub(crate) fn dispatch(
        &self,
        method: &str,
        ctx: CallContext<S>,
        payload: Vec<u8>,
    ) -> Result<HandlerFuture, WireFailure> {
        match self.entries.get(method) {
            Some(handler) => Ok(handler.as_ref()(ctx, payload)),
            None => Err(WireFailure::UnknownMethod(method.to_string())),
        }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.entries.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        config::Config,
        env::Role,
        runtime::Runtime,
        service::LiveConnection,
        supervision::{try_within, Monitor},
    };

    struct Double;
    impl RpcFunction for Double {
        const NAME: &'static str = "double";
        type Input = u32;
        type Output = u32;
    }

    struct Svc;

    #[async_trait]
    impl WorkerService for Svc {
        type WorkerState = ();
        type ConnectionState = ();

        async fn init_worker_state(&self, _runtime: &Runtime<Self>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn init_connection_state(&self, _worker_state: &Arc<()>) -> anyhow::Result<()> {
            Ok(())
        }

        fn functions(registry: &mut FunctionRegistry<Self>) {
            registry.register::<Double, _, _>(|_ctx, n: u32| async move { Ok(n * 2) });
        }
    }

    async fn call(registry: &FunctionRegistry<Svc>, method: &str, payload: Vec<u8>) -> Result<Vec<u8>, WireFailure> {
        let (monitor, _stream) = Monitor::channel();
        let runtime = Runtime::new(Svc, Config::default(), Role::Master);
        let conn = Arc::new(LiveConnection::<Svc>::new(Arc::new(()), 0));
        conn.state.set(()).unwrap();

        try_within(&monitor, |scope| {
            let ctx = CallContext {
                runtime: runtime.clone(),
                conn: conn.clone(),
                scope,
            };
            let dispatched = registry.dispatch(method, ctx, payload);
            async move {
                match dispatched {
                    Ok(call) => Ok(call.await),
                    Err(failure) => Ok(Err(failure)),
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn typed_round_trip_through_the_table() {
        let registry = FunctionRegistry::<Svc>::collect(Serializer::Postcard);
        assert!(registry.contains("double"));
        assert_eq!(registry.len(), 1);

        let payload = Serializer::Postcard.to_bytes(&21u32).unwrap();
        let encoded = call(&registry, "double", payload).await.unwrap();
        let decoded: u32 = Serializer::Postcard.from_bytes(&encoded).unwrap();
        assert_eq!(decoded, 42);
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let registry = FunctionRegistry::<Svc>::collect(Serializer::Postcard);
        let failure = call(&registry, "halve", Vec::new()).await.unwrap_err();
        assert_eq!(failure, WireFailure::UnknownMethod("halve".to_string()));
    }

    #[tokio::test]
    async fn malformed_payload_is_a_codec_failure() {
        let registry = FunctionRegistry::<Svc>::collect(Serializer::Postcard);
        let failure = call(&registry, "double", vec![0xff; 9]).await.unwrap_err();
        assert!(matches!(failure, WireFailure::Codec(_)));
    }
}
