//! Reconnect loop for one logical connection.
//!
//! Each attempt opens a fresh socket, has the platform protect it, connects,
//! runs the handshake, provisions the interface, reports it to the registry,
//! and forwards packets until something fails. Only `SocketUnavailable`
//! failures are absorbed and retried; every other error ends the worker.

use crate::config::{ClientConfig, SharedSecret};
use crate::device::{InterfaceDescriptor, Platform, ProvisionRequest};
use crate::error::{VpnError, VpnResult};
use crate::forwarder::PacketForwarder;
use crate::handshake::HandshakeClient;
use crate::registry::ConnectionId;
use crate::socket::{connect_tunnel_socket, open_tunnel_socket};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Called with the new interface when an attempt establishes.
pub type EstablishCallback = Arc<dyn Fn(Arc<InterfaceDescriptor>) + Send + Sync>;

/// Bounded retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failed attempts (never established) before giving up.
    pub max_consecutive_failures: u32,
    /// Pause after every attempt.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            retry_delay: Duration::from_secs(3),
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> VpnResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VpnError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Drive `attempt` until the failure budget runs out or it returns an error.
///
/// `attempt` resolves to whether the tunnel was established before it ended.
/// An established attempt resets the consecutive-failure count. Returns
/// `Ok(())` when giving up after the budget is spent.
pub(crate) async fn run_attempts<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> VpnResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = VpnResult<bool>>,
{
    let mut failures = 0u32;
    while failures < policy.max_consecutive_failures {
        if attempt().await? {
            failures = 0;
        } else {
            failures += 1;
        }
        log::debug!(
            "Retrying in {:?} ({}/{} consecutive failures)",
            policy.retry_delay,
            failures,
            policy.max_consecutive_failures
        );
        sleep_or_cancel(cancel, policy.retry_delay).await?;
    }
    Ok(())
}

/// Worker for one connect request.
pub struct ReconnectSupervisor {
    id: ConnectionId,
    config: Arc<ClientConfig>,
    platform: Arc<dyn Platform>,
    cancel: CancellationToken,
    on_establish: EstablishCallback,
}

impl ReconnectSupervisor {
    pub fn new(
        id: ConnectionId,
        config: Arc<ClientConfig>,
        platform: Arc<dyn Platform>,
        cancel: CancellationToken,
        on_establish: EstablishCallback,
    ) -> Self {
        Self {
            id,
            config,
            platform,
            cancel,
            on_establish,
        }
    }

    /// Run attempts until giving up (`Ok`) or hitting a non-retried error.
    pub async fn run(self) -> VpnResult<()> {
        log::info!("[conn {}] Starting", self.id);

        let result = self.run_inner().await;
        match &result {
            Ok(()) => log::info!("[conn {}] Giving up", self.id),
            Err(VpnError::Cancelled) => log::info!("[conn {}] Cancelled, exiting", self.id),
            Err(e) => log::error!("[conn {}] Connection failed, exiting: {}", self.id, e),
        }
        result
    }

    async fn run_inner(&self) -> VpnResult<()> {
        let server = self.config.server_addr().await?;
        let secret = self.config.shared_secret()?;
        let policy = self.config.retry_policy();

        run_attempts(&policy, &self.cancel, || self.attempt(server, &secret)).await
    }

    /// One attempt. `Ok(established)` when a retryable failure ended it.
    async fn attempt(&self, server: SocketAddr, secret: &SharedSecret) -> VpnResult<bool> {
        let mut established = false;
        let mut interface = None;

        let result = self
            .establish_and_forward(server, secret, &mut established, &mut interface)
            .await;

        if let Some(interface) = interface {
            interface.close();
        }

        match result {
            Ok(never) => match never {},
            Err(e) if e.is_retryable() => {
                log::warn!("[conn {}] Cannot use socket: {}", self.id, e);
                Ok(established)
            }
            Err(e) => Err(e),
        }
    }

    async fn establish_and_forward(
        &self,
        server: SocketAddr,
        secret: &SharedSecret,
        established: &mut bool,
        interface_slot: &mut Option<Arc<InterfaceDescriptor>>,
    ) -> VpnResult<Infallible> {
        let socket = open_tunnel_socket(server).await?;
        if !self.platform.protect(&socket) {
            return Err(VpnError::socket_unavailable("Cannot protect the tunnel"));
        }
        connect_tunnel_socket(&socket, server).await?;

        let reply = HandshakeClient::new(&socket, secret, &self.cancel)
            .run()
            .await?;

        let mut tunnel_config = reply.config;
        tunnel_config.proxy = self.config.proxy();
        let apps = self.config.app_filter();
        let request = ProvisionRequest {
            config: &tunnel_config,
            session_name: self.config.session_name(),
            apps: &apps,
        };
        let interface = Arc::new(InterfaceDescriptor::new(self.platform.provision(&request).await?));
        *interface_slot = Some(interface.clone());
        *established = true;

        (self.on_establish)(interface.clone());
        log::info!(
            "[conn {}] New interface: {} ({})",
            self.id,
            interface.name(),
            reply.parameters
        );

        PacketForwarder::new(&interface, &socket, &self.cancel)
            .run()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::FakePlatform;
    use std::collections::VecDeque;
    use std::net::UdpSocket;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    async fn scripted(outcomes: Vec<VpnResult<bool>>) -> (VpnResult<()>, usize) {
        let outcomes = Mutex::new(VecDeque::from(outcomes));
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();

        let result = run_attempts(&RetryPolicy::default(), &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            let next = outcomes.lock().unwrap().pop_front().unwrap_or(Ok(false));
            async move { next }
        })
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_failures_give_up() {
        let (result, calls) = scripted(vec![]).await;
        assert!(result.is_ok());
        assert_eq!(calls, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let mut outcomes: Vec<VpnResult<bool>> = (0..9).map(|_| Ok(false)).collect();
        outcomes.push(Ok(true));

        let (result, calls) = scripted(outcomes).await;
        assert!(result.is_ok());
        // 9 failures, 1 success, then a fresh budget of 10 failures.
        assert_eq!(calls, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_ends_immediately() {
        let outcomes = vec![
            Ok(true),
            Ok(false),
            Err(VpnError::HandshakeTimeout { attempts: 50 }),
        ];

        let (result, calls) = scripted(outcomes).await;
        assert!(matches!(result, Err(VpnError::HandshakeTimeout { .. })));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let started = tokio::time::Instant::now();
        let (_, calls) = scripted(vec![]).await;
        assert_eq!(calls, 10);
        assert_eq!(started.elapsed().as_secs(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        let result = run_attempts(&RetryPolicy::default(), &cancel, || {
            canceller.cancel();
            async { Ok(false) }
        })
        .await;
        assert!(matches!(result, Err(VpnError::Cancelled)));
    }

    fn supervisor(
        server: &UdpSocket,
        platform: Arc<FakePlatform>,
        cancel: CancellationToken,
    ) -> ReconnectSupervisor {
        let addr = server.local_addr().unwrap();
        let mut config = ClientConfig::new(addr.ip().to_string(), addr.port());
        config.secret = Some(SharedSecret::new("abc"));
        ReconnectSupervisor::new(
            ConnectionId(1),
            Arc::new(config),
            platform,
            cancel,
            Arc::new(|_: Arc<InterfaceDescriptor>| {}),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_unprotectable_socket_retries_then_gives_up() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let platform = Arc::new(FakePlatform::failing_protect(100));

        let result = supervisor(&server, platform.clone(), CancellationToken::new())
            .run()
            .await;

        assert!(result.is_ok());
        assert_eq!(platform.protect_calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_ends_worker_after_protect_failures() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let platform = Arc::new(FakePlatform::failing_protect(3));

        let result = supervisor(&server, platform.clone(), CancellationToken::new())
            .run()
            .await;

        assert!(matches!(result, Err(VpnError::HandshakeTimeout { .. })));
        assert_eq!(platform.protect_calls(), 4);
        assert!(platform.provisioned.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_established_attempt_provisions_and_reports() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let responder = std::thread::spawn({
            let server = server.try_clone().unwrap();
            move || {
                let mut buf = [0u8; 64];
                let (n, client) = server.recv_from(&mut buf).unwrap();
                server.send_to(b"\0m,1400 a,10.0.0.2,32", client).unwrap();
                buf[..n].to_vec()
            }
        });

        let platform = Arc::new(FakePlatform::default());
        let cancel = CancellationToken::new();
        let reported = Arc::new(Mutex::new(Vec::new()));

        let addr = server.local_addr().unwrap();
        let mut config = ClientConfig::new(addr.ip().to_string(), addr.port());
        config.secret = Some(SharedSecret::new("abc"));
        config.proxy_host = Some("proxy.local".into());
        config.proxy_port = Some(3128);
        config.apps = vec!["browser".into()];

        let on_establish: EstablishCallback = {
            let reported = reported.clone();
            let cancel = cancel.clone();
            Arc::new(move |interface: Arc<InterfaceDescriptor>| {
                reported.lock().unwrap().push(interface);
                cancel.cancel();
            })
        };
        let worker = ReconnectSupervisor::new(
            ConnectionId(7),
            Arc::new(config),
            platform.clone() as Arc<dyn Platform>,
            cancel,
            on_establish,
        );

        let result = worker.run().await;
        assert!(matches!(result, Err(VpnError::Cancelled)));
        assert_eq!(responder.join().unwrap(), b"\0abc".to_vec());

        let provisioned = platform.provisioned.lock().unwrap();
        assert_eq!(provisioned.len(), 1);
        let (tunnel_config, session, apps) = &provisioned[0];
        assert_eq!(tunnel_config.mtu, Some(1400));
        assert_eq!(tunnel_config.proxy.as_ref().unwrap().to_string(), "proxy.local:3128");
        assert_eq!(session, &addr.ip().to_string());
        assert_eq!(apps, &crate::device::AppFilter::Allow(vec!["browser".into()]));

        // The attempt closed the interface it opened on the way out.
        let reported = reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].is_closed());
        assert_eq!(platform.interfaces.lock().unwrap()[0].drops(), 1);
    }
}
