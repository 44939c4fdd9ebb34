#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parley_client_core::media::{
    DisplayCapture, LocalTrack, MediaDevices, MediaError, NoMediaDevices, TrackSlot,
    default_classifier,
};
use parley_client_core::relay::LocalRelay;
use parley_client_core::transport::mock::{MockNetwork, MockTransportFactory};
use parley_client_core::{MeshConfig, MeshDeps, MeshEvent, MeshSession};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout_at};

pub const ROOM: &str = "r1";
const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> MeshConfig {
    MeshConfig {
        reconcile_debounce: Duration::from_millis(10),
        kdf_iterations: 1_000,
        chunk_bytes: 4,
        buffered_high_water: 1_000,
        buffered_low_water: 100,
        backpressure_timeout: Duration::from_secs(5),
        ..MeshConfig::default()
    }
}

/// Camera and screen capture always succeed; there is no microphone.
#[derive(Debug, Default)]
pub struct FakeDevices;

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open_microphone(&self) -> Result<Arc<LocalTrack>, MediaError> {
        Err(MediaError::AudioUnavailable("no microphone".into()))
    }

    async fn open_camera(&self, device_id: Option<&str>) -> Result<Arc<LocalTrack>, MediaError> {
        Ok(LocalTrack::new(
            TrackSlot::Camera,
            device_id.unwrap_or("FaceTime HD Camera"),
        ))
    }

    async fn open_display(&self) -> Result<DisplayCapture, MediaError> {
        Ok(DisplayCapture {
            video: LocalTrack::new(TrackSlot::Screen, "Screen 1"),
            audio: None,
        })
    }
}

pub struct MemberOptions {
    pub config: MeshConfig,
    pub creation_delay: Option<Duration>,
    pub devices: Arc<dyn MediaDevices>,
    pub passphrase: Option<String>,
}

impl Default for MemberOptions {
    fn default() -> Self {
        Self {
            config: test_config(),
            creation_delay: None,
            devices: Arc::new(NoMediaDevices),
            passphrase: None,
        }
    }
}

pub struct TestRoom {
    pub relay: Arc<LocalRelay>,
    pub network: Arc<MockNetwork>,
}

impl TestRoom {
    pub fn new() -> Self {
        Self {
            relay: LocalRelay::new(),
            network: MockNetwork::new(),
        }
    }

    pub async fn join(&self, user_id: &str) -> Member {
        self.join_with(user_id, MemberOptions::default()).await
    }

    pub async fn join_with(&self, user_id: &str, options: MemberOptions) -> Member {
        let (client, inbound) = self.relay.connect(user_id, &format!("user-{user_id}"));
        let mut factory = MockTransportFactory::new(Arc::clone(&self.network));
        if let Some(delay) = options.creation_delay {
            factory = factory.with_creation_delay(delay);
        }
        let mesh = MeshSession::new(
            user_id,
            ROOM,
            options.passphrase.as_deref(),
            options.config,
            MeshDeps {
                transports: Arc::new(factory),
                devices: options.devices,
                signals: client,
                classifier: default_classifier(),
            },
        );
        let events = mesh.subscribe();
        let runner = {
            let mesh = Arc::clone(&mesh);
            tokio::spawn(async move { mesh.run(inbound).await })
        };
        mesh.join().await.expect("join room");
        Member {
            mesh,
            events,
            runner,
        }
    }
}

pub struct Member {
    pub mesh: Arc<MeshSession>,
    pub events: broadcast::Receiver<MeshEvent>,
    runner: JoinHandle<()>,
}

impl Member {
    pub fn id(&self) -> &str {
        self.mesh.local_id()
    }

    pub fn is_ready_with(&self, peer_id: &str) -> bool {
        self.mesh
            .peer(peer_id)
            .is_some_and(|session| session.is_ready())
    }

    /// Skips events until `pick` accepts one.
    pub async fn next_event<T>(&mut self, mut pick: impl FnMut(MeshEvent) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        loop {
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Ok(event)) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) => panic!("{} event stream closed", self.id()),
                Err(_) => panic!("{} timed out waiting for event", self.id()),
            }
        }
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        self.runner.abort();
    }
}

pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

pub async fn connected(a: &Member, b: &Member) {
    wait_for(&format!("{} <-> {}", a.id(), b.id()), || {
        a.is_ready_with(b.id()) && b.is_ready_with(a.id())
    })
    .await;
}
