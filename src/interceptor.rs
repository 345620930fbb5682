//! `Interceptor`, `Chain`, and `InterceptorChain`: the composable
//! application/network plugin dispatcher with `proceed` semantics.
//!
//! Grounded on the nested `Chain` class in `Interceptor.h` from this
//! system's design lineage (`getRequest`/`getConnection`/`proceed`) --
//! a direct port of that contract into a Rust trait-object dispatcher,
//! since the teacher crate has no interceptor-chain concept of its own
//! (its `Middleware` trait is a single flat hook, not a chain).

use crate::error::{Error, Result};
use crate::pool::Connection;
use crate::request::Request;
use crate::response::Response;
use std::sync::Arc;

/// A function object consuming a [`Chain`] and returning a [`Response`].
/// Application interceptors see `chain.connection() == None`; network
/// interceptors see it populated and run only around the actual network
/// round-trip.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response>;
}

/// Exposes the current `Request`, an optional bound `Connection`, and
/// `proceed`, which advances to the next interceptor or, when
/// exhausted, invokes the terminal operation.
pub struct Chain<'a> {
    request: Request,
    connection: Option<Connection>,
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    terminal: &'a dyn Fn(Request) -> Result<Response>,
    proceeded: bool,
}

impl<'a> Chain<'a> {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Advance to the next interceptor (or the terminal operation if
    /// this is the last one), passing `request` onward. May be called
    /// at most once per `Chain` instance; a second call is an
    /// `IllegalState` programming error. Not calling it at all is legal
    /// (the interceptor may synthesize a response itself).
    pub fn proceed(&mut self, request: Request) -> Result<Response> {
        if self.proceeded {
            return Err(Error::illegal_state("Chain::proceed called twice"));
        }
        self.proceeded = true;

        if self.index < self.interceptors.len() {
            let interceptor = Arc::clone(&self.interceptors[self.index]);
            let mut next = Chain {
                request,
                connection: self.connection.clone(),
                interceptors: self.interceptors,
                index: self.index + 1,
                terminal: self.terminal,
                proceeded: false,
            };
            interceptor.intercept(&mut next)
        } else {
            (self.terminal)(request)
        }
    }
}

/// Dispatcher distinguishing application (outer) from network (inner)
/// interceptor lists.
pub struct InterceptorChain {
    application: Vec<Arc<dyn Interceptor>>,
    network: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(application: Vec<Arc<dyn Interceptor>>, network: Vec<Arc<dyn Interceptor>>) -> Self {
        InterceptorChain { application, network }
    }

    /// Run `request` through the application interceptor list; `terminal`
    /// is the whole cache+network machinery for the current request
    /// frame (see `engine::HttpEngine::run_frame`).
    pub fn run_application(
        &self,
        request: Request,
        terminal: &dyn Fn(Request) -> Result<Response>,
    ) -> Result<Response> {
        let mut chain = Chain {
            request: request.clone(),
            connection: None,
            interceptors: &self.application,
            index: 0,
            terminal,
            proceeded: false,
        };
        chain.proceed(request)
    }

    /// Run `request` through the network interceptor list, bound to
    /// `connection`; `terminal` is the actual `Transport::send` call.
    /// Only invoked by the engine when it decides to make a network
    /// round-trip -- never for a pure cache hit.
    pub fn run_network(
        &self,
        request: Request,
        connection: Connection,
        terminal: &dyn Fn(Request) -> Result<Response>,
    ) -> Result<Response> {
        let mut chain = Chain {
            request: request.clone(),
            connection: Some(connection),
            interceptors: &self.network,
            index: 0,
            terminal,
            proceeded: false,
        };
        chain.proceed(request)
    }
}
