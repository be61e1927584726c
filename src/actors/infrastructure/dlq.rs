use async_trait::async_trait;
use kameo::actor::ActorRef;
use kameo::error::Infallible;
use kameo::message::{Context, Message};
use kameo::reply::{Reply, ReplyError};
use kameo::Actor;
use scylla::client::session::Session;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::actors::core::{ComponentHealth, HealthCheckable, HealthStatus};
use crate::messaging::{DeadLetter, DeadLetterSink};

// ============================================================================
// Dead Letter Queue Actor
// ============================================================================
//
// Parks messages nobody could process and events that could not be
// published. Provides:
// - A bounded in-memory list of recent dead letters, oldest evicted first
// - Optional mirroring to the `dead_letter_queue` table in ScyllaDB
// - Counts per origin for manual intervention
//
// ============================================================================

const CREATE_DLQ_TABLE: &str = "CREATE TABLE IF NOT EXISTS dead_letter_queue (
    id uuid PRIMARY KEY,
    origin text,
    queue text,
    payload text,
    error text,
    failed_at timestamp
)";

pub const DEFAULT_DLQ_CAPACITY: usize = 1_000;

pub struct DlqActor {
    letters: VecDeque<DeadLetter>,
    capacity: usize,
    session: Option<Arc<Session>>,
    total: u64,
    by_origin: HashMap<String, u64>,
    mirror_failures: u64,
}

impl DlqActor {
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: VecDeque::new(),
            capacity: capacity.max(1),
            session: None,
            total: 0,
            by_origin: HashMap::new(),
            mirror_failures: 0,
        }
    }

    /// Mirror every parked letter to ScyllaDB. Creates the table if needed.
    pub async fn with_scylla(mut self, session: Arc<Session>) -> anyhow::Result<Self> {
        session.query_unpaged(CREATE_DLQ_TABLE, &[]).await?;
        self.session = Some(session);
        Ok(self)
    }

    async fn mirror(&mut self, letter: &DeadLetter) {
        let Some(session) = &self.session else {
            return;
        };

        let result = session
            .query_unpaged(
                "INSERT INTO dead_letter_queue (id, origin, queue, payload, error, failed_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                (
                    letter.id,
                    letter.origin.as_str(),
                    &letter.queue,
                    &letter.payload,
                    &letter.error,
                    letter.failed_at,
                ),
            )
            .await;

        if let Err(e) = result {
            self.mirror_failures += 1;
            tracing::error!(letter_id = %letter.id, error = %e, "Failed to store dead letter in ScyllaDB");
        }
    }
}

impl Actor for DlqActor {
    type Args = Self;
    type Error = Infallible;

    async fn on_start(state: Self::Args, _actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        tracing::info!(
            capacity = state.capacity,
            persistent = state.session.is_some(),
            "DlqActor started - Dead Letter Queue ready"
        );
        Ok(state)
    }
}

impl HealthCheckable for DlqActor {
    fn check_health(&self) -> ComponentHealth {
        let status = if self.mirror_failures > 0 {
            HealthStatus::Degraded(format!("{} dead letters not persisted", self.mirror_failures))
        } else if self.letters.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded(format!("{} dead letters awaiting replay", self.letters.len()))
        };
        ComponentHealth::new(self.component_name(), status).with_details(format!("{} parked in total", self.total))
    }

    fn component_name(&self) -> &str {
        "dead_letter_queue"
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub struct ParkDeadLetter(pub DeadLetter);

#[derive(Debug)]
pub struct GetDeadLetters {
    pub limit: usize,
}

#[derive(Debug)]
pub struct GetDlqStats;

#[derive(Debug)]
pub struct CheckDlqHealth;

/// Most recent dead letters first.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetters(pub Vec<DeadLetter>);

#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqStats {
    pub total: u64,
    pub held: usize,
    pub by_origin: HashMap<String, u64>,
    pub mirror_failures: u64,
}

macro_rules! infallible_reply {
    ($($ty:ty),*) => {
        $(
            impl Reply for $ty {
                type Ok = Self;
                type Error = Infallible;
                type Value = Self;

                fn to_result(self) -> Result<Self, Infallible> {
                    Ok(self)
                }

                fn into_any_err(self) -> Option<Box<dyn ReplyError>> {
                    None
                }

                fn into_value(self) -> Self::Value {
                    self
                }
            }
        )*
    };
}

infallible_reply!(DeadLetters, DlqStats);

// ============================================================================
// Handlers
// ============================================================================

impl Message<ParkDeadLetter> for DlqActor {
    type Reply = ();

    async fn handle(&mut self, msg: ParkDeadLetter, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let letter = msg.0;

        tracing::error!(
            letter_id = %letter.id,
            origin = %letter.origin,
            queue = %letter.queue,
            error = %letter.error,
            "💀 Adding message to Dead Letter Queue"
        );

        self.mirror(&letter).await;

        self.total += 1;
        *self.by_origin.entry(letter.origin.as_str().to_string()).or_insert(0) += 1;
        if self.letters.len() == self.capacity {
            self.letters.pop_front();
        }
        self.letters.push_back(letter);
    }
}

impl Message<GetDeadLetters> for DlqActor {
    type Reply = DeadLetters;

    async fn handle(&mut self, msg: GetDeadLetters, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        DeadLetters(self.letters.iter().rev().take(msg.limit).cloned().collect())
    }
}

impl Message<GetDlqStats> for DlqActor {
    type Reply = DlqStats;

    async fn handle(&mut self, _msg: GetDlqStats, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        DlqStats {
            total: self.total,
            held: self.letters.len(),
            by_origin: self.by_origin.clone(),
            mirror_failures: self.mirror_failures,
        }
    }
}

impl Message<CheckDlqHealth> for DlqActor {
    type Reply = ComponentHealth;

    async fn handle(&mut self, _msg: CheckDlqHealth, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.check_health()
    }
}

#[async_trait]
impl DeadLetterSink for ActorRef<DlqActor> {
    async fn park(&self, letter: DeadLetter) {
        let letter_id = letter.id;
        if let Err(e) = self.tell(ParkDeadLetter(letter)).send().await {
            tracing::error!(letter_id = %letter_id, error = %e, "Dead letter queue unavailable, dropping message");
        }
    }
}
