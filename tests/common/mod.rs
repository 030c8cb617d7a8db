//! Scripted in-memory connections shared by the integration tests.
//!
//! Every connection operation is recorded as an [`Event`] so tests can assert
//! exactly which physical connection was pinged, rolled back or closed.

#![allow(dead_code)]

use db_resilience::config::PoolOptions;
use db_resilience::db::{
    Connection, ConnectionPool, Connector, FetchMode, JsonRow, QueryOutput, QueryParam, Sleeper,
};
use db_resilience::error::{DbError, DbResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect(usize),
    ConnectFailed,
    Ping(usize),
    Run(usize, String),
    Rollback(usize),
    Close(usize),
}

pub enum Outcome {
    Ok(QueryOutput),
    Fail(String),
    FailIo(std::io::ErrorKind),
    Hang,
}

#[derive(Default)]
struct ScriptState {
    next_id: usize,
    events: Vec<Event>,
    run_outcomes: VecDeque<Outcome>,
    connect_failures: VecDeque<String>,
    fail_ping: bool,
    fail_rollback: bool,
}

/// Shared script driving every connection opened by its connector.
#[derive(Clone, Default)]
pub struct Script(Arc<Mutex<ScriptState>>);

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> ScriptedConnector {
        ScriptedConnector {
            script: self.clone(),
        }
    }

    pub fn push_ok(&self, output: QueryOutput) {
        self.state().run_outcomes.push_back(Outcome::Ok(output));
    }

    pub fn push_fail(&self, message: &str) {
        self.state()
            .run_outcomes
            .push_back(Outcome::Fail(message.to_string()));
    }

    /// Fail the next statement with a socket-level driver error.
    pub fn push_io_failure(&self, kind: std::io::ErrorKind) {
        self.state().run_outcomes.push_back(Outcome::FailIo(kind));
    }

    pub fn push_hang(&self) {
        self.state().run_outcomes.push_back(Outcome::Hang);
    }

    pub fn push_connect_failure(&self, message: &str) {
        self.state()
            .connect_failures
            .push_back(message.to_string());
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.state().fail_ping = fail;
    }

    pub fn set_fail_rollback(&self, fail: bool) {
        self.state().fail_rollback = fail;
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.state().events.iter().filter(|e| pred(e)).count()
    }

    pub fn connects(&self) -> usize {
        self.count(|e| matches!(e, Event::Connect(_)))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, Event::Rollback(_)))
    }

    pub fn closes(&self) -> usize {
        self.count(|e| matches!(e, Event::Close(_)))
    }

    /// Connection ids that ran a statement, in order.
    pub fn run_ids(&self) -> Vec<usize> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Run(id, _) => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.0.lock().unwrap()
    }
}

pub struct ScriptedConnector {
    script: Script,
}

impl Connector for ScriptedConnector {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> DbResult<ScriptedConnection> {
        let id = {
            let mut state = self.script.state();
            if let Some(message) = state.connect_failures.pop_front() {
                state.events.push(Event::ConnectFailed);
                return Err(driver_error(&message));
            }
            let id = state.next_id;
            state.next_id += 1;
            state.events.push(Event::Connect(id));
            id
        };
        Ok(ScriptedConnection {
            id,
            script: self.script.clone(),
        })
    }

    fn target(&self) -> String {
        "scripted".to_string()
    }
}

pub struct ScriptedConnection {
    pub id: usize,
    script: Script,
}

impl Connection for ScriptedConnection {
    async fn ping(&mut self) -> DbResult<()> {
        let fail = {
            let mut state = self.script.state();
            state.events.push(Event::Ping(self.id));
            state.fail_ping
        };
        if fail {
            return Err(driver_error("server closed the connection unexpectedly"));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let fail = {
            let mut state = self.script.state();
            state.events.push(Event::Rollback(self.id));
            state.fail_rollback
        };
        if fail {
            return Err(driver_error("connection is closed"));
        }
        Ok(())
    }

    async fn run(
        &mut self,
        statement: &str,
        _params: &[QueryParam],
        _fetch: FetchMode,
    ) -> DbResult<QueryOutput> {
        let outcome = {
            let mut state = self.script.state();
            state.events.push(Event::Run(self.id, statement.to_string()));
            state.run_outcomes.pop_front()
        };
        match outcome {
            None => Ok(QueryOutput::Rows(Vec::new())),
            Some(Outcome::Ok(output)) => Ok(output),
            Some(Outcome::Fail(message)) => Err(driver_error(&message)),
            Some(Outcome::FailIo(kind)) => {
                Err(DbError::Driver(sqlx::Error::Io(std::io::Error::from(kind))))
            }
            Some(Outcome::Hang) => std::future::pending().await,
        }
    }

    async fn close(self) -> DbResult<()> {
        self.script.state().events.push(Event::Close(self.id));
        Ok(())
    }
}

/// Records requested delays and returns immediately.
#[derive(Clone, Default)]
pub struct RecordingSleeper(Arc<Mutex<Vec<Duration>>>);

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.0.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.0.lock().unwrap().push(duration);
    }
}

pub fn driver_error(message: &str) -> DbError {
    DbError::Driver(sqlx::Error::Protocol(message.to_string()))
}

pub fn row(column: &str, value: serde_json::Value) -> JsonRow {
    let mut row = JsonRow::new();
    row.insert(column.to_string(), value);
    row
}

/// Pool options with nothing pre-opened and a short acquire timeout.
pub fn test_options(max_connections: u32) -> PoolOptions {
    PoolOptions {
        max_connections,
        min_connections: 0,
        recycle: Duration::from_secs(3600),
        acquire_timeout: Duration::from_millis(50),
        pre_ping: false,
    }
}

pub fn test_pool(script: &Script, options: PoolOptions) -> Arc<ConnectionPool<ScriptedConnector>> {
    ConnectionPool::new(script.connector(), options)
}

/// Poll until `cond` holds, for background cleanup spawned on drop.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
