//! `Call`, `Callback`, and `WorkerPool`: the one-shot execution unit and
//! its bounded async backing, plus the redirect-following loop that
//! re-enters the application interceptor chain per hop.
//!
//! Grounded on `RealCall`/`AsyncCall`'s one-shot `executed` flag and
//! idempotent `cancel()` from this system's design lineage; the worker
//! pool itself follows the teacher crate's use of `crossbeam-channel`
//! for bounded background work.

use crate::config::ClientFacade;
use crate::engine::{redirect_target, HttpEngine};
use crate::error::{Error, Result};
use crate::interceptor::InterceptorChain;
use crate::request::Request;
use crate::response::Response;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Total network attempts (1 original + 5 redirect follow-ups) permitted
/// per `Call`, per §8 testable property 4.
const MAX_NETWORK_ATTEMPTS: u32 = 6;

/// Receives the outcome of an [`Call::execute_async`] call exactly once,
/// on a worker thread.
pub trait Callback: Send {
    /// Invoked with the final response on success.
    fn on_response(&self, response: Response);
    /// Invoked with a typed error on failure, including a cancelled call.
    fn on_failure(&self, error: Error);
}

/// A one-shot unit of execution: one logical request, followed through
/// any redirects, against a `ClientFacade`'s cache/pool/interceptors.
pub struct Call {
    facade: Arc<ClientFacade>,
    request: Request,
    executed: AtomicBool,
    active_connection: Arc<Mutex<Option<crate::pool::Connection>>>,
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("url", &self.request.url())
            .field("method", &self.request.method())
            .field("executed", &self.executed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Call {
    pub(crate) fn new(facade: Arc<ClientFacade>, request: Request) -> Self {
        Call {
            facade,
            request,
            executed: AtomicBool::new(false),
            active_connection: Arc::new(Mutex::new(None)),
        }
    }

    /// Run the chain on the calling thread. One-shot: a second call (via
    /// either `execute` or `execute_async`) fails with `IllegalState`.
    pub fn execute(&self) -> Result<Response> {
        self.claim()?;
        self.run()
    }

    /// Enqueue the chain's execution on the facade's worker pool.
    /// `callback` is invoked exactly once, on a worker thread: with the
    /// response on success, or with a typed error (including a
    /// cancelled call) on failure. A second `execute`/`execute_async` on
    /// the same `Call` -- including from within this very callback --
    /// fails the SAME way `execute` does, by the one-shot check never
    /// admitting it; the callback for the second attempt fires with
    /// that `IllegalState` error.
    pub fn execute_async(self: &Arc<Self>, callback: impl Callback + 'static) {
        let call = Arc::clone(self);
        self.facade.workers.submit(move || match call.claim() {
            Ok(()) => match call.run() {
                Ok(response) => callback.on_response(response),
                Err(error) => callback.on_failure(error),
            },
            Err(error) => callback.on_failure(error),
        });
    }

    /// Idempotent. May be invoked before, during, or after execution.
    /// Before: the pending/next `execute`/`execute_async` fails with a
    /// cancelled `Execution` error. During: best-effort abort of the
    /// currently bound connection. After completion: no effect, still
    /// returns `true`.
    pub fn cancel(&self) -> bool {
        self.request.cancelled.store(true, Ordering::SeqCst);
        if let Some(connection) = self.active_connection.lock().as_ref() {
            connection.cancel();
        }
        true
    }

    /// Claims the one-shot `executed` flag first, so a second
    /// `execute`/`execute_async` on an already-run (or already-claimed)
    /// `Call` always raises `IllegalState`, even if the call was later
    /// cancelled; a cancellation observed on the FIRST claim instead
    /// surfaces as the cancelled `Execution` error (§8 S7 vs. the plain
    /// double-execute case).
    fn claim(&self) -> Result<()> {
        if self.executed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err()
        {
            return Err(Error::illegal_state("Call::execute called more than once"));
        }
        if self.request.is_cancelled() {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    fn run(&self) -> Result<Response> {
        let chain = crate::config::ClientFacadeBuilder::chain(&self.facade);
        let engine = HttpEngine::with_active_connection(
            Arc::clone(&self.facade),
            Arc::clone(&self.active_connection),
        );

        let mut current = self.request.clone();
        let mut prior: Option<Response> = None;
        let mut attempts = 0u32;

        loop {
            if current.is_cancelled() {
                return Err(Error::cancelled());
            }
            attempts += 1;

            let request_for_frame = current.clone();
            let prior_for_frame = prior.clone();
            let response = chain.run_application(request_for_frame, &|req| {
                engine.run_frame(req, &chain, prior_for_frame.clone())
            })?;

            let target = redirect_target(
                response.request().method(),
                response.status(),
                response.headers(),
                response.request().url(),
            );
            match target {
                None => return Ok(response),
                Some(_) if attempts >= MAX_NETWORK_ATTEMPTS => {
                    return Err(Error::execution(
                        format!("redirect cap exceeded after {MAX_NETWORK_ATTEMPTS} network attempts"),
                        std::io::Error::other("too many redirects"),
                    ));
                }
                Some(url) => {
                    let _ = response.take_body().map(|mut b| b.close());
                    current = current.with_url(url);
                    prior = Some(response);
                }
            }
        }
    }
}

/// A bounded pool of background worker threads backing `Call::execute_async`.
/// Default 5 workers, per §5.
pub struct WorkerPool {
    sender: crossbeam_channel::Sender<Job>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("workers", &self.handles.lock().len()).finish()
    }
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("rustic-http-worker-{id}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
        WorkerPool { sender, handles: Mutex::new(handles) }
    }

    /// Enqueue `job` to run on the next free worker.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::transport::{MockTransport, ScriptedResponse};
    use http::Method;
    use std::sync::mpsc;
    use tempfile::TempDir;
    use url::Url;

    fn facade(transport: MockTransport) -> Arc<ClientFacade> {
        ClientFacade::builder(transport).build().unwrap()
    }

    fn request(url: &str) -> Request {
        Request::builder(Method::GET, Url::parse(url).unwrap()).build()
    }

    #[test]
    fn execute_returns_response_and_is_one_shot() {
        let transport = MockTransport::new();
        transport.script("http://h/p", ScriptedResponse::new(200, "OK").body(b"response data 1".to_vec()));
        let facade = facade(transport);
        let call = facade.new_call(request("http://h/p"));

        let response = call.execute().unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);

        let second = call.execute();
        assert!(matches!(second, Err(Error::IllegalState(_))));
    }

    #[test]
    fn cancel_before_execute_fails_the_call() {
        let transport = MockTransport::new();
        let facade = facade(transport);
        let call = facade.new_call(request("http://h/p"));
        assert!(call.cancel());
        let result = call.execute();
        assert!(matches!(result, Err(Error::Execution { cancelled: true, .. })));
    }

    #[test]
    fn execute_async_invokes_callback_exactly_once() {
        let transport = MockTransport::new();
        transport.script("http://h/p", ScriptedResponse::new(200, "OK").body(b"response data 1".to_vec()));
        let facade = facade(transport);
        let call = Arc::new(facade.new_call(request("http://h/p")));

        let (tx, rx) = mpsc::channel::<Result<Response>>();
        let ok_tx = tx.clone();
        let err_tx = tx;
        struct ChannelCallback {
            ok: mpsc::Sender<Result<Response>>,
            err: mpsc::Sender<Result<Response>>,
        }
        impl Callback for ChannelCallback {
            fn on_response(&self, response: Response) {
                let _ = self.ok.send(Ok(response));
            }
            fn on_failure(&self, error: Error) {
                let _ = self.err.send(Err(error));
            }
        }
        call.execute_async(ChannelCallback { ok: ok_tx, err: err_tx });
        let result = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap().status(), http::StatusCode::OK);
    }

    #[test]
    fn redirect_chain_follows_307_and_links_prior_response() {
        let transport = MockTransport::new();
        transport.script(
            "http://h/start",
            ScriptedResponse::new(307, "Temporary Redirect")
                .header("location", "http://h/p?a=10&b=20")
                .body(b"redirect data 1".to_vec()),
        );
        transport.script(
            "http://h/p?a=10&b=20",
            ScriptedResponse::new(200, "OK").body(b"response data 1".to_vec()),
        );
        let facade = facade(transport);
        let call = facade.new_call(request("http://h/start"));

        let response = call.execute().unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        let prior = response.prior_response().unwrap();
        assert_eq!(prior.status().as_u16(), 307);
        assert_eq!(prior.request().url().as_str(), "http://h/start");
    }

    #[test]
    fn self_redirect_loop_is_capped_at_six_attempts() {
        let transport = MockTransport::new();
        for _ in 0..10 {
            transport.script(
                "http://h/loop",
                ScriptedResponse::new(307, "Temporary Redirect").header("location", "http://h/loop"),
            );
        }
        let facade = facade(transport);
        let call = facade.new_call(request("http://h/loop"));
        let result = call.execute();
        assert!(matches!(result, Err(Error::Execution { .. })));
    }

    #[test]
    fn post_after_cached_get_invalidates_entry_via_engine() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        transport.script(
            "http://h/p",
            ScriptedResponse::new(200, "OK")
                .header("cache-control", "max-age=3600")
                .body(b"response data 1".to_vec()),
        );
        transport.script("http://h/p", ScriptedResponse::new(200, "OK").body(b"updated".to_vec()));
        let cache = ResponseCache::open(dir.path(), 10_000).unwrap();
        let facade = ClientFacade::builder(transport).cache(cache).build().unwrap();

        let get = facade.new_call(request("http://h/p"));
        let first = get.execute().unwrap();
        let _ = first.take_body().unwrap().close();
        assert!(facade.cache().unwrap().lookup(&crate::fingerprint::fingerprint(&Method::GET, &Url::parse("http://h/p").unwrap())).unwrap().is_some());

        let post = facade.new_call(Request::builder(Method::POST, Url::parse("http://h/p").unwrap()).build());
        let posted = post.execute().unwrap();
        let _ = posted.take_body().unwrap().close();

        assert!(facade.cache().unwrap().lookup(&crate::fingerprint::fingerprint(&Method::GET, &Url::parse("http://h/p").unwrap())).unwrap().is_none());
    }
}
