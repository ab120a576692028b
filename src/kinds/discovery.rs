//! Network discovery tasks: LAN scan, wireless network scan, lobby room
//! listing, content compatibility probes and NAT traversal checks.
//!
//! All network access goes through [`DiscoveryBackend`] so tests and
//! embedders can substitute their own stack; [`LobbyDiscoveryBackend`] is
//! the default HTTP/UDP implementation. In cooperative mode the backend call
//! runs on a helper thread the handler polls, so a scan window never stalls
//! a tick.

use std::net::UdpSocket;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::TaskEngine;
use crate::error::{PushError, TaskError};
use crate::task::{
    Payload, PeerInfo, StepOutcome, TaskContext, TaskHandler, TaskId, TaskKind, TaskOutcome,
    TaskReport, TaskSpec, WifiNetwork,
};

/// UDP port LAN peers answer discovery probes on.
const LAN_DISCOVERY_PORT: u16 = 55435;
/// How long a LAN scan waits for responses.
const LAN_SCAN_WINDOW: Duration = Duration::from_millis(800);

/// Network operations behind the discovery task kinds.
pub trait DiscoveryBackend: Send + Sync {
    /// Broadcast a probe and collect responding peers.
    fn lan_scan(&self) -> Result<Vec<PeerInfo>, TaskError>;

    /// Fetch the public room list from the lobby server.
    fn room_list(&self) -> Result<Vec<PeerInfo>, TaskError>;

    /// Check whether `port` is reachable from outside.
    fn nat_traversal(&self, port: u16) -> Result<bool, TaskError>;

    /// Scan for nearby wireless networks. Backends without a wifi stack keep
    /// the default, which fails the task with a descriptive message.
    fn wifi_scan(&self) -> Result<Vec<WifiNetwork>, TaskError> {
        Err(TaskError::msg("wifi scanning is not supported by this backend"))
    }
}

/// Default backend: lobby over HTTP, LAN probes over UDP broadcast.
pub struct LobbyDiscoveryBackend {
    http: reqwest::blocking::Client,
    lobby_url: Option<String>,
}

impl LobbyDiscoveryBackend {
    pub fn new(http: reqwest::blocking::Client, lobby_url: Option<String>) -> Self {
        Self { http, lobby_url }
    }
}

impl DiscoveryBackend for LobbyDiscoveryBackend {
    fn lan_scan(&self) -> Result<Vec<PeerInfo>, TaskError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(LAN_SCAN_WINDOW))?;
        socket.send_to(b"RANQUERY", ("255.255.255.255", LAN_DISCOVERY_PORT))?;

        let mut peers = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, addr)) => match serde_json::from_slice::<PeerInfo>(&buf[..len]) {
                    Ok(mut peer) => {
                        peer.address = addr.ip().to_string();
                        peers.push(peer);
                    }
                    Err(e) => debug!("Ignoring malformed discovery response from {}: {}", addr, e),
                },
                // Timeout ends the collection window.
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!("LAN scan found {} peers", peers.len());
        Ok(peers)
    }

    fn room_list(&self) -> Result<Vec<PeerInfo>, TaskError> {
        let Some(url) = self.lobby_url.as_deref() else {
            return Err(TaskError::msg("no lobby server configured"));
        };
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|e| TaskError::msg(format!("lobby request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(TaskError::msg(format!(
                "lobby returned HTTP {}",
                response.status()
            )));
        }
        let rooms: Vec<PeerInfo> = response
            .json()
            .map_err(|e| TaskError::msg(format!("malformed lobby response: {e}")))?;
        Ok(rooms)
    }

    fn nat_traversal(&self, port: u16) -> Result<bool, TaskError> {
        // Best-effort reachability check: a port already bound locally is in
        // use by the session and counted as announced.
        match std::net::TcpListener::bind(("0.0.0.0", port)) {
            Ok(_) => Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Ok(true),
            Err(e) => {
                warn!("NAT traversal check for port {} failed: {}", port, e);
                Err(e.into())
            }
        }
    }
}

/// Handler running a single backend call. With `offload` the call runs on a
/// helper thread and each step only polls the result channel; otherwise the
/// call blocks the one step it runs in (threaded mode).
struct BackendCallHandler<F> {
    call: Option<F>,
    offload: bool,
    pending: Option<Receiver<Result<TaskOutcome, TaskError>>>,
}

impl<F> BackendCallHandler<F> {
    fn new(offload: bool, call: F) -> Self {
        Self {
            call: Some(call),
            offload,
            pending: None,
        }
    }
}

impl<F> TaskHandler for BackendCallHandler<F>
where
    F: FnOnce() -> Result<TaskOutcome, TaskError> + Send + 'static,
{
    fn step(&mut self, _ctx: &TaskContext) -> Result<StepOutcome, TaskError> {
        if let Some(pending) = &self.pending {
            return match pending.try_recv() {
                Ok(result) => Ok(StepOutcome::Finished(result?)),
                Err(TryRecvError::Empty) => Ok(StepOutcome::Pending),
                Err(TryRecvError::Disconnected) => {
                    Err(TaskError::msg("discovery worker exited without a result"))
                }
            };
        }

        let Some(call) = self.call.take() else {
            return Err(TaskError::msg("discovery handler stepped twice"));
        };
        if !self.offload {
            return Ok(StepOutcome::Finished(call()?));
        }
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("discovery-io".to_string())
            .spawn(move || {
                let _ = tx.send(call());
            })?;
        self.pending = Some(rx);
        Ok(StepOutcome::Pending)
    }
}

/// A room only qualifies when its advertised core and subsystem agree with
/// the requested ones. Rooms that do not advertise a value are kept.
fn matches_session(room: &PeerInfo, core: Option<&str>, subsystem: Option<&str>) -> bool {
    let core_ok = match (core, room.core.as_deref()) {
        (Some(wanted), Some(advertised)) => wanted.eq_ignore_ascii_case(advertised),
        _ => true,
    };
    let subsystem_ok = match (subsystem, room.subsystem.as_deref()) {
        (Some(wanted), Some(advertised)) => wanted.eq_ignore_ascii_case(advertised),
        _ => true,
    };
    core_ok && subsystem_ok
}

/// Pick rooms compatible with the given content, by checksum first and by
/// name as a fallback.
fn filter_compatible(rooms: Vec<PeerInfo>, crc: u32, name: &str) -> Vec<PeerInfo> {
    let by_crc: Vec<PeerInfo> = rooms
        .iter()
        .filter(|r| r.content_crc == Some(crc))
        .cloned()
        .collect();
    if !by_crc.is_empty() {
        return by_crc;
    }
    rooms
        .into_iter()
        .filter(|r| r.name.eq_ignore_ascii_case(name))
        .collect()
}

impl TaskEngine {
    /// Push a LAN discovery scan.
    pub fn push_lan_scan(
        &self,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
    ) -> Result<TaskId, PushError> {
        let backend = std::sync::Arc::clone(&self.discovery);
        let handler = BackendCallHandler::new(self.offload_io(), move || {
            backend.lan_scan().map(TaskOutcome::Peers)
        });
        let id = self.submit(
            TaskSpec::new(TaskKind::Discovery, "Scanning local network", handler)
                .mute(true)
                .callback(callback),
        )?;
        debug!("Pushed LAN scan {}", id);
        Ok(id)
    }

    /// Push a wireless network scan. The callback receives the networks the
    /// backend reported.
    pub fn push_wifi_scan(
        &self,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
    ) -> Result<TaskId, PushError> {
        let backend = std::sync::Arc::clone(&self.discovery);
        let handler = BackendCallHandler::new(self.offload_io(), move || {
            backend.wifi_scan().map(TaskOutcome::WifiNetworks)
        });
        let id = self.submit(
            TaskSpec::new(TaskKind::Discovery, "Scanning wireless networks", handler)
                .mute(true)
                .callback(callback),
        )?;
        debug!("Pushed wifi scan {}", id);
        Ok(id)
    }

    /// Push a lobby room listing.
    pub fn push_room_list(
        &self,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
    ) -> Result<TaskId, PushError> {
        let backend = std::sync::Arc::clone(&self.discovery);
        let handler = BackendCallHandler::new(self.offload_io(), move || {
            backend.room_list().map(TaskOutcome::Peers)
        });
        let id = self.submit(
            TaskSpec::new(TaskKind::Discovery, "Fetching room list", handler)
                .mute(true)
                .callback(callback),
        )?;
        debug!("Pushed room list fetch {}", id);
        Ok(id)
    }

    /// Push a compatibility probe: fetches the room list, keeps the rooms
    /// whose core and subsystem agree with the session, then matches the
    /// content by checksum and falls back to its name.
    pub fn push_content_crc_scan(
        &self,
        crc: u32,
        name: &str,
        hostname: Option<&str>,
        core: Option<&str>,
        subsystem: Option<&str>,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
    ) -> Result<TaskId, PushError> {
        if name.is_empty() {
            return Err(PushError::InvalidArgument("empty content name".to_string()));
        }
        let backend = std::sync::Arc::clone(&self.discovery);
        let name_owned = name.to_string();
        let hostname = hostname.map(str::to_string);
        let core = core.map(str::to_string);
        let subsystem = subsystem.map(str::to_string);
        let handler = BackendCallHandler::new(self.offload_io(), move || {
            let rooms = backend.room_list()?;
            let rooms = match &hostname {
                Some(host) => rooms
                    .into_iter()
                    .filter(|r| r.address.eq_ignore_ascii_case(host))
                    .collect(),
                None => rooms,
            };
            let rooms: Vec<PeerInfo> = rooms
                .into_iter()
                .filter(|r| matches_session(r, core.as_deref(), subsystem.as_deref()))
                .collect();
            Ok(TaskOutcome::Peers(filter_compatible(
                rooms, crc, &name_owned,
            )))
        });
        let title = format!("Probing rooms for {name}");
        let id = self.submit(
            TaskSpec::new(TaskKind::Discovery, title, handler)
                .mute(true)
                .callback(callback),
        )?;
        debug!("Pushed content probe {} (crc {:08x})", id, crc);
        Ok(id)
    }

    /// Push a NAT traversal check for a session port.
    pub fn push_nat_traversal(
        &self,
        port: u16,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
    ) -> Result<TaskId, PushError> {
        if port == 0 {
            return Err(PushError::InvalidArgument("port must be nonzero".to_string()));
        }
        let backend = std::sync::Arc::clone(&self.discovery);
        let handler = BackendCallHandler::new(self.offload_io(), move || {
            backend.nat_traversal(port).map(TaskOutcome::NatTraversal)
        });
        let id = self.submit(
            TaskSpec::new(TaskKind::Discovery, format!("Probing port {port}"), handler)
                .mute(true)
                .callback(callback),
        )?;
        debug!("Pushed NAT traversal check {} for port {}", id, port);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::task::TaskState;
    use std::sync::{Arc, Mutex};

    struct FakeBackend {
        rooms: Vec<PeerInfo>,
        reachable: bool,
        networks: Vec<WifiNetwork>,
        delay: Duration,
    }

    impl DiscoveryBackend for FakeBackend {
        fn lan_scan(&self) -> Result<Vec<PeerInfo>, TaskError> {
            std::thread::sleep(self.delay);
            Ok(self.rooms.clone())
        }

        fn room_list(&self) -> Result<Vec<PeerInfo>, TaskError> {
            Ok(self.rooms.clone())
        }

        fn nat_traversal(&self, _port: u16) -> Result<bool, TaskError> {
            Ok(self.reachable)
        }

        fn wifi_scan(&self) -> Result<Vec<WifiNetwork>, TaskError> {
            Ok(self.networks.clone())
        }
    }

    fn peer(name: &str, crc: Option<u32>) -> PeerInfo {
        PeerInfo {
            name: name.to_string(),
            address: "10.0.0.1".to_string(),
            port: 55435,
            core: None,
            subsystem: None,
            content_crc: crc,
        }
    }

    fn engine_with_backend(backend: FakeBackend) -> TaskEngine {
        let mut engine = TaskEngine::new(EngineConfig::default()).unwrap();
        engine.set_discovery_backend(Arc::new(backend));
        engine
    }

    fn engine_with(rooms: Vec<PeerInfo>, reachable: bool) -> TaskEngine {
        engine_with_backend(FakeBackend {
            rooms,
            reachable,
            networks: Vec::new(),
            delay: Duration::ZERO,
        })
    }

    fn run_until_empty(engine: &TaskEngine) {
        for _ in 0..1000 {
            engine.tick();
            if engine.pending_tasks() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("engine did not drain");
    }

    #[test]
    fn room_list_delivers_peers() {
        let engine = engine_with(vec![peer("Room A", None), peer("Room B", None)], false);
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_room_list(move |report, _| {
                assert_eq!(report.state, TaskState::Finished);
                if let TaskOutcome::Peers(peers) = report.outcome {
                    *slot_inner.lock().unwrap() = Some(peers);
                }
            })
            .unwrap();

        run_until_empty(&engine);
        let peers = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(peers.len(), 2);
    }

    #[test]
    fn crc_scan_prefers_checksum_matches() {
        let engine = engine_with(
            vec![
                peer("Same Name", None),
                peer("Other", Some(0xdeadbeef)),
                peer("Another", Some(0x1234)),
            ],
            false,
        );
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_content_crc_scan(
                0xdeadbeef,
                "Same Name",
                None,
                None,
                None,
                move |report, _| {
                    if let TaskOutcome::Peers(peers) = report.outcome {
                        *slot_inner.lock().unwrap() = Some(peers);
                    }
                },
            )
            .unwrap();

        run_until_empty(&engine);
        let peers = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "Other");
    }

    #[test]
    fn crc_scan_falls_back_to_name_match() {
        let engine = engine_with(
            vec![peer("Wanted Game", Some(0x1111)), peer("Other", Some(0x2222))],
            false,
        );
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_content_crc_scan(0x9999, "wanted game", None, None, None, move |report, _| {
                if let TaskOutcome::Peers(peers) = report.outcome {
                    *slot_inner.lock().unwrap() = Some(peers);
                }
            })
            .unwrap();

        run_until_empty(&engine);
        let peers = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "Wanted Game");
    }

    #[test]
    fn crc_scan_drops_rooms_running_a_different_core() {
        let mut wrong_core = peer("Wrong", Some(0xdeadbeef));
        wrong_core.core = Some("other_core".to_string());
        let mut right_core = peer("Right", Some(0xdeadbeef));
        right_core.core = Some("wanted_core".to_string());

        let engine = engine_with(vec![wrong_core, right_core], false);
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_content_crc_scan(
                0xdeadbeef,
                "Right",
                None,
                Some("Wanted_Core"),
                None,
                move |report, _| {
                    if let TaskOutcome::Peers(peers) = report.outcome {
                        *slot_inner.lock().unwrap() = Some(peers);
                    }
                },
            )
            .unwrap();

        run_until_empty(&engine);
        let peers = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "Right");
    }

    #[test]
    fn crc_scan_drops_rooms_running_a_different_subsystem() {
        let mut mismatched = peer("Linked", Some(0xcafe));
        mismatched.subsystem = Some("solo".to_string());
        let mut matched = peer("Linked Too", Some(0xcafe));
        matched.subsystem = Some("link".to_string());

        let engine = engine_with(vec![mismatched, matched], false);
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_content_crc_scan(
                0xcafe,
                "Linked",
                None,
                None,
                Some("link"),
                move |report, _| {
                    if let TaskOutcome::Peers(peers) = report.outcome {
                        *slot_inner.lock().unwrap() = Some(peers);
                    }
                },
            )
            .unwrap();

        run_until_empty(&engine);
        let peers = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "Linked Too");
    }

    #[test]
    fn wifi_scan_delivers_networks() {
        let engine = engine_with_backend(FakeBackend {
            rooms: Vec::new(),
            reachable: false,
            networks: vec![WifiNetwork {
                ssid: "Home".to_string(),
                connected: true,
                signal: Some(72),
            }],
            delay: Duration::ZERO,
        });
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_wifi_scan(move |report, _| {
                assert_eq!(report.state, TaskState::Finished);
                if let TaskOutcome::WifiNetworks(networks) = report.outcome {
                    *slot_inner.lock().unwrap() = Some(networks);
                }
            })
            .unwrap();

        run_until_empty(&engine);
        let networks = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].ssid, "Home");
        assert!(networks[0].connected);
    }

    #[test]
    fn wifi_scan_errors_on_a_backend_without_wifi_support() {
        // The default lobby backend has no wifi stack.
        let engine = TaskEngine::new(EngineConfig::default()).unwrap();
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_wifi_scan(move |report, _| {
                *slot_inner.lock().unwrap() = Some((report.state, report.error));
            })
            .unwrap();

        run_until_empty(&engine);
        let (state, error) = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(state, TaskState::Errored);
        assert!(error.unwrap().contains("not supported"));
    }

    #[test]
    fn cooperative_tick_is_not_stalled_by_a_slow_scan() {
        let engine = engine_with_backend(FakeBackend {
            rooms: vec![peer("Slow Room", None)],
            reachable: false,
            networks: Vec::new(),
            delay: Duration::from_millis(500),
        });
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_lan_scan(move |report, _| {
                if let TaskOutcome::Peers(peers) = report.outcome {
                    *slot_inner.lock().unwrap() = Some(peers);
                }
            })
            .unwrap();

        for _ in 0..10 {
            let start = std::time::Instant::now();
            engine.tick();
            assert!(
                start.elapsed() < Duration::from_millis(200),
                "a single cooperative tick blocked for {:?}",
                start.elapsed()
            );
        }

        run_until_empty(&engine);
        let peers = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn nat_traversal_rejects_port_zero() {
        let engine = engine_with(Vec::new(), false);
        let result = engine.push_nat_traversal(0, |_, _| {});
        assert!(matches!(result, Err(PushError::InvalidArgument(_))));
    }

    #[test]
    fn nat_traversal_reports_backend_verdict() {
        let engine = engine_with(Vec::new(), true);
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_nat_traversal(19731, move |report, _| {
                if let TaskOutcome::NatTraversal(announced) = report.outcome {
                    *slot_inner.lock().unwrap() = Some(announced);
                }
            })
            .unwrap();

        run_until_empty(&engine);
        assert_eq!(slot.lock().unwrap().take(), Some(true));
    }

    #[test]
    fn lobby_backend_without_url_errors_room_list() {
        let backend =
            LobbyDiscoveryBackend::new(reqwest::blocking::Client::new(), None);
        let result = backend.room_list();
        assert!(result.is_err());
    }
}
