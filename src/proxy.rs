//! Interface proxies.
//!
//! An interface is declared once with [`remote_interface!`](crate::remote_interface),
//! which generates:
//!
//! - the trait itself, every method returning `Result<R, CallError>`
//! - an [`InterfaceDescriptor`] with the stable method identities
//! - a proxy struct that implements the trait by turning every call into a
//!   transaction on one captured [`TransportHandle`]
//! - a [`Dispatcher`] adapter that routes incoming transactions to a local
//!   implementation of the trait
//!
//! ```ignore
//! remote_interface! {
//!     pub trait Calculator as "calculator" {
//!         proxy CalculatorProxy;
//!         service CalculatorService;
//!
//!         fn plus(a: i64, b: i64) -> i64;
//!     }
//! }
//! ```

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::bridge::{decode_reply, encode_arg, invoke, MethodId, Reply, Transaction};
use crate::error::{CallError, RemoteFault};
use crate::transport::TransportHandle;

/// One declared method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: &'static str,
    /// Ordered `(name, type)` pairs.
    pub params: &'static [(&'static str, &'static str)],
    pub returns: &'static str,
}

impl MethodDescriptor {
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Immutable description of an interface, built once per interface type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// Wire name; the first half of every method identity.
    pub name: &'static str,
    pub methods: &'static [MethodDescriptor],
}

impl InterfaceDescriptor {
    pub fn method(&self, name: &str) -> Option<&'static MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn method_id(&self, name: &str) -> MethodId {
        MethodId::new(self.name, name)
    }

    pub fn method_ids(&self) -> Vec<MethodId> {
        self.methods.iter().map(|m| self.method_id(m.name)).collect()
    }
}

/// A generated, typed proxy.
pub trait InterfaceProxy: Sized + Send + Sync {
    fn descriptor() -> &'static InterfaceDescriptor;

    fn from_core(core: ProxyCore) -> Self;

    fn core(&self) -> &ProxyCore;

    /// The handle captured when the proxy was built.
    fn handle(&self) -> &TransportHandle {
        self.core().handle()
    }

    /// `true` once the captured handle is no longer live; every call then
    /// fails with [`CallError::StaleHandle`].
    fn is_stale(&self) -> bool {
        self.core().is_stale()
    }
}

/// Build a typed proxy on `handle`.
///
/// The handle is captured by value. The proxy never follows reconnections:
/// after the handle dies, build a new proxy on a fresh one.
pub fn create_proxy<P: InterfaceProxy>(handle: &TransportHandle) -> P {
    P::from_core(ProxyCore::new(P::descriptor(), handle.clone()))
}

/// The interception point shared by every proxy: descriptor plus one handle
/// snapshot.
#[derive(Clone)]
pub struct ProxyCore {
    descriptor: &'static InterfaceDescriptor,
    handle: TransportHandle,
}

impl ProxyCore {
    pub fn new(descriptor: &'static InterfaceDescriptor, handle: TransportHandle) -> Self {
        Self { descriptor, handle }
    }

    pub fn descriptor(&self) -> &'static InterfaceDescriptor {
        self.descriptor
    }

    pub fn handle(&self) -> &TransportHandle {
        &self.handle
    }

    pub fn is_stale(&self) -> bool {
        !self.handle.is_alive()
    }

    /// Redirect a call into a transaction and return the raw reply payload.
    ///
    /// # Errors
    ///
    /// `InvalidCall` if `method` is not declared or `args` has the wrong
    /// arity; otherwise whatever the bridge reports.
    pub async fn intercept(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        let declared = self.descriptor.method(method).ok_or_else(|| {
            CallError::InvalidCall(format!(
                "interface {} has no method {}",
                self.descriptor.name, method
            ))
        })?;
        if declared.arity() != args.len() {
            return Err(CallError::InvalidCall(format!(
                "{}.{} takes {} argument(s), got {}",
                self.descriptor.name,
                method,
                declared.arity(),
                args.len()
            )));
        }

        debug!(handle = %self.handle.id(), interface = self.descriptor.name, method, "intercepted call");
        invoke(&self.handle, self.descriptor.method_id(method), args).await
    }

    /// [`intercept`](Self::intercept) and decode the reply as `R`.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<R, CallError> {
        decode_reply(self.intercept(method, args).await?)
    }

    /// Entry point used by generated proxies.
    pub async fn send<R: DeserializeOwned>(
        &self,
        method: &str,
        args: ArgWriter,
    ) -> Result<R, CallError> {
        let args = args.finish()?;
        self.call(method, args).await
    }
}

impl fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCore")
            .field("interface", &self.descriptor.name)
            .field("handle", &self.handle)
            .finish()
    }
}

/// A proxy without a generated type: calls are made by method name against
/// any descriptor.
#[derive(Debug, Clone)]
pub struct DynamicProxy {
    core: ProxyCore,
}

impl DynamicProxy {
    pub fn new(descriptor: &'static InterfaceDescriptor, handle: &TransportHandle) -> Self {
        Self {
            core: ProxyCore::new(descriptor, handle.clone()),
        }
    }

    pub fn descriptor(&self) -> &'static InterfaceDescriptor {
        self.core.descriptor()
    }

    pub fn is_stale(&self) -> bool {
        self.core.is_stale()
    }

    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.core.intercept(method, args).await
    }

    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<R, CallError> {
        self.core.call(method, args).await
    }
}

/// Collects encoded arguments for one call, keeping the first encode error.
#[derive(Debug, Default)]
pub struct ArgWriter {
    args: Vec<Value>,
    error: Option<CallError>,
}

impl ArgWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: Serialize + ?Sized>(&mut self, value: &T) {
        if self.error.is_some() {
            return;
        }
        match encode_arg(value) {
            Ok(value) => self.args.push(value),
            Err(err) => self.error = Some(err),
        }
    }

    pub fn finish(self) -> Result<Vec<Value>, CallError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.args),
        }
    }
}

/// Server-side counterpart of a proxy: answers transactions for one
/// interface.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    fn descriptor(&self) -> &'static InterfaceDescriptor;

    /// Handle one transaction. Unknown methods and malformed arguments are
    /// answered with a fault, never a panic.
    async fn dispatch(&self, transaction: Transaction) -> Reply;
}

/// Reads positional arguments out of an incoming transaction.
#[derive(Debug)]
pub struct ArgReader {
    method: MethodId,
    args: std::vec::IntoIter<Value>,
}

impl ArgReader {
    pub fn new(method: &MethodId, args: Vec<Value>) -> Self {
        Self {
            method: method.clone(),
            args: args.into_iter(),
        }
    }

    pub fn next_arg<T: DeserializeOwned>(&mut self, name: &str) -> Result<T, RemoteFault> {
        let value = self.args.next().ok_or_else(|| {
            RemoteFault::invalid_params(format!("{}: missing argument `{}`", self.method, name))
        })?;
        serde_json::from_value(value).map_err(|e| {
            RemoteFault::invalid_params(format!("{}: argument `{}`: {}", self.method, name, e))
        })
    }

    /// Reject leftover arguments.
    pub fn finish(&mut self) -> Result<(), RemoteFault> {
        match self.args.len() {
            0 => Ok(()),
            extra => Err(RemoteFault::invalid_params(format!(
                "{}: {} unexpected extra argument(s)",
                self.method, extra
            ))),
        }
    }
}

/// Serialize a handler's return value into a reply payload.
pub fn encode_reply<T: Serialize + ?Sized>(value: &T) -> Result<Value, RemoteFault> {
    serde_json::to_value(value)
        .map_err(|e| RemoteFault::internal(format!("Failed to encode reply: {}", e)))
}

/// Declare a remotely implemented interface.
///
/// Generates the trait, its proxy type and its dispatcher adapter. Every
/// method must spell out its return type (`-> ()` for none). Argument and
/// return types must be serde-serializable and `Send`.
#[macro_export]
macro_rules! remote_interface {
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident as $wire:literal {
            proxy $proxy:ident;
            service $service:ident;
            $(
                $(#[$mmeta:meta])*
                fn $method:ident( $( $arg:ident : $ty:ty ),* $(,)? ) -> $ret:ty;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis trait $name: ::std::marker::Send + ::std::marker::Sync {
            $(
                $(#[$mmeta])*
                fn $method(&self $(, $arg: $ty)*)
                    -> impl ::std::future::Future<
                        Output = ::std::result::Result<$ret, $crate::CallError>,
                    > + ::std::marker::Send;
            )*
        }

        #[doc = concat!("Typed proxy for the `", $wire, "` interface.")]
        #[derive(Debug, Clone)]
        $vis struct $proxy {
            core: $crate::proxy::ProxyCore,
        }

        impl $crate::proxy::InterfaceProxy for $proxy {
            fn descriptor() -> &'static $crate::proxy::InterfaceDescriptor {
                static DESCRIPTOR: $crate::proxy::InterfaceDescriptor =
                    $crate::proxy::InterfaceDescriptor {
                        name: $wire,
                        methods: &[
                            $(
                                $crate::proxy::MethodDescriptor {
                                    name: stringify!($method),
                                    params: &[ $( (stringify!($arg), stringify!($ty)) ),* ],
                                    returns: stringify!($ret),
                                },
                            )*
                        ],
                    };
                &DESCRIPTOR
            }

            fn from_core(core: $crate::proxy::ProxyCore) -> Self {
                Self { core }
            }

            fn core(&self) -> &$crate::proxy::ProxyCore {
                &self.core
            }
        }

        impl $name for $proxy {
            $(
                fn $method(&self $(, $arg: $ty)*)
                    -> impl ::std::future::Future<
                        Output = ::std::result::Result<$ret, $crate::CallError>,
                    > + ::std::marker::Send
                {
                    #[allow(unused_mut)]
                    let mut args = $crate::proxy::ArgWriter::new();
                    $( args.push(&$arg); )*
                    async move { self.core.send::<$ret>(stringify!($method), args).await }
                }
            )*
        }

        #[doc = concat!("Routes `", $wire, "` transactions to a local implementation.")]
        $vis struct $service<S> {
            inner: ::std::sync::Arc<S>,
        }

        impl<S: $name + 'static> $service<S> {
            pub fn new(service: S) -> Self {
                Self { inner: ::std::sync::Arc::new(service) }
            }

            pub fn from_arc(service: ::std::sync::Arc<S>) -> Self {
                Self { inner: service }
            }

            pub fn inner(&self) -> &S {
                &self.inner
            }

            async fn route(
                &self,
                method: &$crate::bridge::MethodId,
                args: &mut $crate::proxy::ArgReader,
            ) -> ::std::result::Result<$crate::__private::serde_json::Value, $crate::RemoteFault> {
                $(
                    if method.method() == stringify!($method) {
                        $( let $arg: $ty = args.next_arg(stringify!($arg))?; )*
                        args.finish()?;
                        let result = self.inner.$method($($arg),*).await?;
                        return $crate::proxy::encode_reply(&result);
                    }
                )*
                ::std::result::Result::Err($crate::RemoteFault::method_not_found(method))
            }
        }

        #[$crate::__private::async_trait]
        impl<S: $name + 'static> $crate::proxy::Dispatcher for $service<S> {
            fn descriptor(&self) -> &'static $crate::proxy::InterfaceDescriptor {
                <$proxy as $crate::proxy::InterfaceProxy>::descriptor()
            }

            async fn dispatch(&self, transaction: $crate::bridge::Transaction) -> $crate::bridge::Reply {
                let $crate::bridge::Transaction { method, args } = transaction;
                if method.interface() != $wire {
                    return $crate::bridge::Reply::Fault($crate::RemoteFault::method_not_found(&method));
                }
                let mut reader = $crate::proxy::ArgReader::new(&method, args);
                self.route(&method, &mut reader).await.into()
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::local::LocalBinder;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    crate::remote_interface! {
        /// Test interface.
        trait Greeter as "greeter" {
            proxy GreeterProxy;
            service GreeterService;

            /// Greets someone.
            fn greet(name: String) -> String;
            fn shout(name: String, times: u32) -> String;
            fn refuse() -> ();
        }
    }

    struct English;

    impl Greeter for English {
        async fn greet(&self, name: String) -> Result<String, CallError> {
            Ok(format!("Hello, {}", name))
        }

        async fn shout(&self, name: String, times: u32) -> Result<String, CallError> {
            Ok(format!("HEY {}", name.to_uppercase()).repeat(times as usize))
        }

        async fn refuse(&self) -> Result<(), CallError> {
            Err(CallError::remote("not today"))
        }
    }

    fn handle() -> TransportHandle {
        TransportHandle::new(LocalBinder::new(GreeterService::new(English)))
    }

    #[test]
    fn test_descriptor_is_built_from_declaration() {
        let descriptor = GreeterProxy::descriptor();
        assert_eq!(descriptor.name, "greeter");
        assert_eq!(
            descriptor.method_ids(),
            vec![
                MethodId::new("greeter", "greet"),
                MethodId::new("greeter", "shout"),
                MethodId::new("greeter", "refuse"),
            ]
        );
        let shout = descriptor.method("shout").unwrap();
        assert_eq!(shout.params, &[("name", "String"), ("times", "u32")]);
        assert_eq!(shout.returns, "String");
        assert!(std::ptr::eq(descriptor, GreeterProxy::descriptor()));
    }

    #[tokio::test]
    async fn test_proxy_round_trip() {
        let proxy: GreeterProxy = create_proxy(&handle());
        assert_eq!(proxy.greet("Ada".to_string()).await.unwrap(), "Hello, Ada");
        assert_eq!(
            proxy.shout("ada".to_string(), 2).await.unwrap(),
            "HEY ADAHEY ADA"
        );
    }

    #[tokio::test]
    async fn test_remote_error_is_typed() {
        let proxy: GreeterProxy = create_proxy(&handle());
        match proxy.refuse().await {
            Err(CallError::Remote(fault)) => {
                assert_eq!(fault, RemoteFault::application("not today"));
            }
            other => panic!("Expected remote fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_proxy_fails_every_call() {
        let handle = handle();
        let proxy: GreeterProxy = create_proxy(&handle);
        handle.notify_death();

        assert!(proxy.is_stale());
        assert!(proxy.greet("Ada".to_string()).await.unwrap_err().is_stale());
        assert!(proxy.refuse().await.unwrap_err().is_stale());
    }

    #[tokio::test]
    async fn test_dynamic_proxy_validates_calls() {
        let proxy = DynamicProxy::new(GreeterProxy::descriptor(), &handle());

        let greeting: String = proxy.call("greet", vec![json!("Bob")]).await.unwrap();
        assert_eq!(greeting, "Hello, Bob");

        let unknown = proxy.invoke("wave", vec![]).await.unwrap_err();
        assert!(matches!(unknown, CallError::InvalidCall(_)));

        let arity = proxy.invoke("greet", vec![]).await.unwrap_err();
        assert!(matches!(arity, CallError::InvalidCall(_)));
    }

    #[tokio::test]
    async fn test_dispatcher_rejects_bad_transactions() {
        let service = GreeterService::new(English);

        let wrong_interface = service
            .dispatch(Transaction::new(MethodId::new("calculator", "greet"), vec![json!("x")]))
            .await;
        assert!(matches!(wrong_interface, Reply::Fault(f) if f.code == RemoteFault::METHOD_NOT_FOUND));

        let unknown = service
            .dispatch(Transaction::new(MethodId::new("greeter", "wave"), vec![]))
            .await;
        assert!(matches!(unknown, Reply::Fault(f) if f.code == RemoteFault::METHOD_NOT_FOUND));

        let bad_type = service
            .dispatch(Transaction::new(MethodId::new("greeter", "greet"), vec![json!(42)]))
            .await;
        assert!(matches!(bad_type, Reply::Fault(f) if f.code == RemoteFault::INVALID_PARAMS));

        let extra = service
            .dispatch(Transaction::new(
                MethodId::new("greeter", "greet"),
                vec![json!("a"), json!("b")],
            ))
            .await;
        assert!(matches!(extra, Reply::Fault(f) if f.code == RemoteFault::INVALID_PARAMS));
    }

    #[test]
    fn test_arg_writer_keeps_order() {
        let mut writer = ArgWriter::new();
        writer.push(&10);
        writer.push("twenty");
        assert_eq!(writer.finish().unwrap(), vec![json!(10), json!("twenty")]);
    }
}
