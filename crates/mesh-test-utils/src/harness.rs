//! Multi-participant harness.
//!
//! Every participant gets its own `MeshCoordinator`, scripted transport
//! factory and local media source. All of them share one `MemoryRelay` and
//! one `Journal`, so a test can drive a whole room and assert on the
//! ordering of relay writes and transport closes across participants.

use crate::fixtures::{camera_and_microphone, test_config, TestParticipant, TestRoom};
use common::config::ObservabilityConfig;
use common::observability::init_tracing;
use common::types::ParticipantId;
use mesh_client::actors::{MeshCoordinator, MeshCoordinatorHandle, MeshEvent, Membership};
use mesh_client::media::{LocalMedia, LocalMediaSource};
use mesh_client::signaling::Relay;
use mesh_client::testing::{Journal, MemoryRelay, MockBehavior, MockTransportFactory};
use mesh_client::transport::TransportFactory;
use mesh_client::Config;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long [`eventually`] waits before failing the test.
pub const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a tracing subscriber for tests, once per process.
///
/// Silent unless `RUST_LOG` is set, e.g. `RUST_LOG=mesh=debug`.
pub fn init_test_tracing() {
    let config = ObservabilityConfig {
        log_level: "off".to_string(),
        json_logs: false,
    };
    // A second call in the same test binary finds the subscriber installed.
    let _ = init_tracing(&config);
}

/// Poll `check` until it returns `true`, panicking after
/// [`EVENTUALLY_TIMEOUT`].
///
/// Works with both real and paused clocks: under a paused clock the sleeps
/// auto-advance time.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + EVENTUALLY_TIMEOUT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {EVENTUALLY_TIMEOUT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Receive events until one matches `predicate`, panicking after
/// [`EVENTUALLY_TIMEOUT`].
pub async fn wait_for_event<P>(events: &mut broadcast::Receiver<MeshEvent>, predicate: P) -> MeshEvent
where
    P: Fn(&MeshEvent) -> bool,
{
    tokio::time::timeout(EVENTUALLY_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// One participant in a [`MeshHarness`].
#[derive(Clone)]
pub struct TestMember {
    pub participant: TestParticipant,
    pub handle: MeshCoordinatorHandle,
    pub transports: Arc<MockTransportFactory>,
    pub media: Arc<LocalMediaSource>,
}

impl TestMember {
    #[must_use]
    pub fn id(&self) -> &ParticipantId {
        &self.participant.participant_id
    }

    /// Ids of peers whose session is `Connected`, in order.
    pub async fn connected_peer_ids(&self) -> Vec<String> {
        self.handle
            .list_connected_peers()
            .await
            .map(|peers| peers.iter().map(|p| p.peer_id.to_string()).collect())
            .unwrap_or_default()
    }

    /// Ids of peers with any live session, in order.
    pub async fn session_peer_ids(&self) -> Vec<String> {
        self.handle
            .get_state()
            .await
            .map(|state| state.sessions.iter().map(|s| s.peer_id.to_string()).collect())
            .unwrap_or_default()
    }

    /// State name of the session for `peer`, if one exists.
    pub async fn session_state(&self, peer: &str) -> Option<&'static str> {
        let state = self.handle.get_state().await.ok()?;
        state
            .sessions
            .iter()
            .find(|s| s.peer_id.as_str() == peer)
            .map(|s| s.state)
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.handle.subscribe_events()
    }
}

/// Several coordinators in one room over one in-memory relay.
pub struct MeshHarness {
    pub room: TestRoom,
    pub relay: Arc<MemoryRelay>,
    pub journal: Journal,
    config: Config,
    behavior: MockBehavior,
    members: HashMap<String, TestMember>,
    tasks: HashMap<String, JoinHandle<()>>,
}

impl Default for MeshHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshHarness {
    /// Harness with [`test_config`] and transports that connect as soon as
    /// negotiation completes.
    #[must_use]
    pub fn new() -> Self {
        init_test_tracing();
        let journal = Journal::new();
        Self {
            room: TestRoom::default(),
            relay: Arc::new(MemoryRelay::with_journal(journal.clone())),
            journal,
            config: test_config(),
            behavior: MockBehavior::connected(),
            members: HashMap::new(),
            tasks: HashMap::new(),
        }
    }

    /// Configuration for participants joining from now on.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Transport behavior for participants joining from now on.
    #[must_use]
    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Change the transport behavior for participants joining from now on.
    pub fn set_behavior(&mut self, behavior: MockBehavior) {
        self.behavior = behavior;
    }

    /// Join `id` with a camera and microphone.
    ///
    /// # Panics
    ///
    /// Panics if the coordinator fails to spawn.
    pub async fn join(&mut self, id: &str) -> TestMember {
        self.join_as(TestParticipant::new(id)).await
    }

    /// Join `participant` with a camera and microphone.
    ///
    /// # Panics
    ///
    /// Panics if the coordinator fails to spawn.
    pub async fn join_as(&mut self, participant: TestParticipant) -> TestMember {
        self.try_join_as(participant)
            .await
            .expect("coordinator should spawn")
    }

    /// Join `participant`, returning the spawn error instead of panicking.
    ///
    /// # Errors
    ///
    /// Whatever `MeshCoordinator::spawn` returns.
    pub async fn try_join_as(
        &mut self,
        participant: TestParticipant,
    ) -> Result<TestMember, mesh_client::MeshError> {
        let transports = Arc::new(MockTransportFactory::with_journal(
            self.behavior.clone(),
            self.journal.clone(),
        ));
        let media = Arc::new(LocalMediaSource::new(camera_and_microphone()));

        let (handle, task) = MeshCoordinator::spawn(
            self.config.clone(),
            Membership::new(
                self.room.id.clone(),
                participant.participant_id.clone(),
                participant.display_name.clone(),
            ),
            self.relay.clone() as Arc<dyn Relay>,
            transports.clone() as Arc<dyn TransportFactory>,
            media.clone() as Arc<dyn LocalMedia>,
            CancellationToken::new(),
        )
        .await?;

        let key = participant.participant_id.to_string();
        let member = TestMember {
            participant,
            handle,
            transports,
            media,
        };
        self.members.insert(key.clone(), member.clone());
        self.tasks.insert(key, task);
        Ok(member)
    }

    /// Member previously joined as `id`.
    ///
    /// # Panics
    ///
    /// Panics if no such member joined.
    #[must_use]
    pub fn member(&self, id: &str) -> &TestMember {
        self.members
            .get(id)
            .unwrap_or_else(|| panic!("no member {id}"))
    }

    /// Wait for the coordinator of `id` to exit.
    ///
    /// # Panics
    ///
    /// Panics if it does not exit within [`EVENTUALLY_TIMEOUT`] or the
    /// task panicked.
    pub async fn wait_stopped(&mut self, id: &str) {
        if let Some(task) = self.tasks.remove(id) {
            tokio::time::timeout(EVENTUALLY_TIMEOUT, task)
                .await
                .expect("coordinator should stop")
                .expect("coordinator task should not panic");
        }
    }

    /// Whether the coordinator of `id` is still running.
    #[must_use]
    pub fn is_running(&self, id: &str) -> bool {
        self.tasks.get(id).is_some_and(|t| !t.is_finished())
    }

    /// Leave every member still in the room.
    pub async fn leave_all(&mut self) {
        let ids: Vec<String> = self.members.keys().cloned().collect();
        for id in ids {
            if let Some(member) = self.members.get(&id) {
                let _ = member.handle.leave().await;
            }
            self.wait_stopped(&id).await;
        }
    }
}
