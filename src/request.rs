use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client};
use tokio::task::spawn_blocking;
use tracing::debug;

use crate::{
    config::{Realm, RunContext},
    parse::parse_page,
    shutdown::ShutdownSignal,
    BackoffPolicy, FetchError, PageResult,
};

/// A single page request, no retries.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn fetch_once(
        &self,
        realm: &Realm,
        page: u32,
        page_size: u32,
    ) -> Result<PageResult, FetchError>;
}

/// The leaderboard API over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    // Client uses Arc so we can clone cheaply
    client: Client,
}

impl HttpTransport {
    /// `timeout` bounds each request on its own, not a page's whole retry sequence.
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_once(
        &self,
        realm: &Realm,
        page: u32,
        page_size: u32,
    ) -> Result<PageResult, FetchError> {
        let res = self.client.get(realm.page_url(page, page_size)).send().await?;

        let status = res.status();
        if !status.is_success() {
            let retry_after = res
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::from_status(status.as_u16(), retry_after));
        }

        let body = res.bytes().await?;
        spawn_blocking(move || parse_page(&body, page, page_size))
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()))?
    }
}

/// Fetches pages, retrying transient failures with backoff.
pub struct PageClient<T> {
    transport: T,
    backoff: BackoffPolicy,
    max_attempts: u32,
    page_size: u32,
    shutdown: ShutdownSignal,
}

impl<T: Transport> PageClient<T> {
    pub fn new(transport: T, ctx: &RunContext, shutdown: ShutdownSignal) -> Self {
        Self {
            transport,
            backoff: ctx.backoff,
            max_attempts: ctx.max_attempts.max(1),
            page_size: ctx.page_size,
            shutdown,
        }
    }

    /// Fetches `page` (1-based).
    ///
    /// Transient failures are retried up to the attempt limit, after which the
    /// last cause comes back wrapped in `Exhausted`. Client errors and malformed
    /// payloads come back straight away. Once shutdown starts no new attempt is
    /// made and pending backoff sleeps end with `Cancelled`.
    pub async fn fetch(&self, realm: &Realm, page: u32) -> Result<PageResult, FetchError> {
        debug_assert!(page >= 1, "pages are 1-based");
        let mut attempt = 0;
        loop {
            if self.shutdown.is_draining() {
                return Err(FetchError::Cancelled);
            }
            attempt += 1;

            let err = match self.transport.fetch_once(realm, page, self.page_size).await {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };
            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = match &err {
                FetchError::RateLimited { retry_after } => {
                    self.backoff.rate_limited_delay(attempt, *retry_after)
                }
                _ => self.backoff.delay(attempt),
            };
            let delay = self.backoff.jittered(delay, &mut rand::thread_rng());
            debug!(realm = %realm.name, page, attempt, ?delay, error = %err, "retrying page");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.draining() => return Err(FetchError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::atomic::{AtomicU32, Ordering},
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::shutdown::ShutdownCoordinator;

    /// Replays scripted failures per page, then succeeds with an empty page.
    #[derive(Default)]
    struct Scripted {
        script: Mutex<HashMap<u32, VecDeque<FetchError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn fail(self, page: u32, errors: Vec<FetchError>) -> Self {
            self.script.lock().insert(page, errors.into());
            self
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn fetch_once(
            &self,
            _realm: &Realm,
            page: u32,
            _page_size: u32,
        ) -> Result<PageResult, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().get_mut(&page).and_then(VecDeque::pop_front);
            match next {
                Some(err) => Err(err),
                None => Ok(PageResult {
                    page,
                    entries: vec![],
                    total: Some(0),
                }),
            }
        }
    }

    fn client(transport: Scripted, shutdown: ShutdownSignal) -> PageClient<Scripted> {
        let mut ctx = RunContext::new(Realm::lookup("www").unwrap());
        ctx.max_attempts = 3;
        ctx.backoff = BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            ..Default::default()
        };
        PageClient::new(transport, &ctx, shutdown)
    }

    fn realm() -> Realm {
        Realm::lookup("www").unwrap()
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let coordinator = ShutdownCoordinator::new();
        let transport = Scripted::default().fail(
            3,
            vec![
                FetchError::Timeout,
                FetchError::RateLimited {
                    retry_after: Some(Duration::from_millis(2)),
                },
            ],
        );
        let client = client(transport, coordinator.signal());

        let page = client.fetch(&realm(), 3).await.unwrap();
        assert_eq!(page.page, 3);
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let coordinator = ShutdownCoordinator::new();
        for err in [FetchError::Client(404), FetchError::Malformed("bad".into())] {
            let transport = Scripted::default().fail(1, vec![err.clone()]);
            let client = client(transport, coordinator.signal());
            assert_eq!(client.fetch(&realm(), 1).await, Err(err));
            assert_eq!(client.transport.calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn exhausted_retries_carry_last_cause() {
        let coordinator = ShutdownCoordinator::new();
        let transport = Scripted::default().fail(
            2,
            vec![
                FetchError::Timeout,
                FetchError::Network("reset".into()),
                FetchError::Server(503),
                FetchError::Timeout,
            ],
        );
        let client = client(transport, coordinator.signal());
        assert_eq!(
            client.fetch(&realm(), 2).await,
            Err(FetchError::Exhausted {
                attempts: 3,
                last: Box::new(FetchError::Server(503)),
            })
        );
    }

    #[tokio::test]
    async fn shutdown_stops_new_attempts() {
        let coordinator = ShutdownCoordinator::new();
        let transport = Scripted::default().fail(1, vec![FetchError::Timeout]);
        let client = client(transport, coordinator.signal());
        coordinator.interrupt();

        assert_eq!(client.fetch(&realm(), 1).await, Err(FetchError::Cancelled));
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 0);
    }

    /// Serves one canned HTTP response per connection, in order.
    async fn serve(responses: Vec<String>) -> std::net::SocketAddr {
        use tokio::{
            io::{AsyncReadExt, AsyncWriteExt},
            net::TcpListener,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        addr
    }

    fn response(status: &str, headers: &[&str], body: &str) -> String {
        let mut res = format!("HTTP/1.1 {status}\r\n");
        for header in headers {
            res.push_str(header);
            res.push_str("\r\n");
        }
        res.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ));
        res
    }

    #[tokio::test]
    async fn http_statuses_and_retry_after() {
        let body = r#"{"data": [{"id": 1, "rank": 1}, {"profile_id": 2, "rank": 2}], "total": 2}"#;
        let addr = serve(vec![
            response("429 Too Many Requests", &["Retry-After: 3"], ""),
            response("503 Service Unavailable", &[], ""),
            response("404 Not Found", &[], ""),
            response("200 OK", &["Content-Type: application/json"], body),
        ])
        .await;

        let transport = HttpTransport {
            client: Client::builder().no_proxy().build().unwrap(),
        };
        let realm = Realm::new("local", format!("http://{addr}/"));

        assert_eq!(
            transport.fetch_once(&realm, 1, 400).await,
            Err(FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            })
        );
        assert_eq!(
            transport.fetch_once(&realm, 1, 400).await,
            Err(FetchError::Server(503))
        );
        assert_eq!(
            transport.fetch_once(&realm, 1, 400).await,
            Err(FetchError::Client(404))
        );

        let page = transport.fetch_once(&realm, 1, 400).await.unwrap();
        assert_eq!(page.total, Some(2));
        let ids: Vec<_> = page.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["1", "2"]);
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let coordinator = ShutdownCoordinator::new();
        let transport = Scripted::default().fail(
            1,
            vec![FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(3600)),
            }],
        );
        let client = client(transport, coordinator.signal());

        let realm = realm();
        let fetch = client.fetch(&realm, 1);
        let interrupt = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            coordinator.interrupt();
        };
        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(fetch, interrupt)
        })
        .await
        .unwrap();
        assert_eq!(result, Err(FetchError::Cancelled));
        assert_eq!(client.transport.calls.load(Ordering::SeqCst), 1);
    }
}
