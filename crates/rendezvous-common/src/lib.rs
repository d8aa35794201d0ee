// Shared run identity, keyspace derivation and event records used across crates.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("missing run parameter: {0}")]
    MissingParam(&'static str),
    #[error("invalid run parameter {name}: {value}")]
    InvalidParam { name: &'static str, value: String },
}

/// Identity of the run a participant belongs to.
///
/// Every key and topic touched by a client is scoped under the [`Keyspace`]
/// derived from these parameters, so several runs can share one store.
///
/// ```
/// use rendezvous_common::RunParams;
///
/// let params = RunParams::new("plan", "case", "run-1");
/// assert_eq!(params.keyspace().as_str(), "run:run-1:plan:plan:case:case");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub test_plan: String,
    pub test_case: String,
    pub test_run: String,
    #[serde(default)]
    pub test_group_id: String,
    #[serde(default)]
    pub test_instance_count: u64,
}

impl RunParams {
    pub fn new(
        test_plan: impl Into<String>,
        test_case: impl Into<String>,
        test_run: impl Into<String>,
    ) -> Self {
        Self {
            test_plan: test_plan.into(),
            test_case: test_case.into(),
            test_run: test_run.into(),
            test_group_id: String::new(),
            test_instance_count: 0,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.test_group_id = group_id.into();
        self
    }

    pub fn with_instance_count(mut self, count: u64) -> Self {
        self.test_instance_count = count;
        self
    }

    /// Read run identity from `TEST_PLAN`, `TEST_CASE`, `TEST_RUN`,
    /// `TEST_GROUP_ID` and `TEST_INSTANCE_COUNT`.
    pub fn from_env() -> Result<Self> {
        let required = |name: &'static str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .ok_or(Error::MissingParam(name))
        };
        let mut params = Self::new(
            required("TEST_PLAN")?,
            required("TEST_CASE")?,
            required("TEST_RUN")?,
        );
        if let Ok(group) = std::env::var("TEST_GROUP_ID") {
            params.test_group_id = group;
        }
        if let Ok(value) = std::env::var("TEST_INSTANCE_COUNT") {
            params.test_instance_count =
                value.parse().map_err(|_| Error::InvalidParam {
                    name: "TEST_INSTANCE_COUNT",
                    value,
                })?;
        }
        Ok(params)
    }

    pub fn keyspace(&self) -> Keyspace {
        Keyspace(Arc::from(format!(
            "run:{}:plan:{}:case:{}",
            self.test_run, self.test_plan, self.test_case
        )))
    }
}

/// Run-scoped prefix for every store key. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Keyspace(Arc<str>);

impl Keyspace {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn state_key(&self, state: &State) -> String {
        format!("{}:states:{}", self.0, state.0)
    }

    pub fn topic_key(&self, topic: &str) -> String {
        format!("{}:topics:{}", self.0, topic)
    }

    pub fn sequence_key(&self, name: &str) -> String {
        format!("{}:seq:{}", self.0, name)
    }

    pub fn events_key(&self) -> String {
        format!("{}:run_events", self.0)
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named synchronization point whose counter lives in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct State(String);

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for State {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for State {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A topic carrying JSON-encoded values of type `T`.
pub struct Topic<T> {
    name: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Topic<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic").field("name", &self.name).finish()
    }
}

/// Run lifecycle record published on the run events topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Start { group_id: String },
    Message { group_id: String, message: String },
    Success { group_id: String },
    Failure { group_id: String, error: String },
    Crash {
        group_id: String,
        error: String,
        stacktrace: String,
    },
    StageStart { name: String, group_id: String },
    StageEnd { name: String, group_id: String },
}

impl Event {
    pub fn group_id(&self) -> &str {
        match self {
            Event::Start { group_id }
            | Event::Message { group_id, .. }
            | Event::Success { group_id }
            | Event::Failure { group_id, .. }
            | Event::Crash { group_id, .. }
            | Event::StageStart { group_id, .. }
            | Event::StageEnd { group_id, .. } => group_id,
        }
    }

    /// Terminal events end a participant's run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Success { .. } | Event::Failure { .. } | Event::Crash { .. }
        )
    }
}
