//! In-memory driver for testing
//!
//! Statements are matched against scripted replies by substring, in the
//! order the replies were added. One-shot replies are consumed by the first
//! statement they match; persistent replies answer every match. Statements
//! with no matching reply return an empty result.

use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use trellis_core::{Driver, Parameters, QueryOutput, Transaction};

/// One executed statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statement {
    pub query: String,
    pub params: Parameters,
}

impl Statement {
    /// Whether the statement modifies the graph
    pub fn is_write(&self) -> bool {
        ["MERGE", "CREATE", "DELETE", "SET"]
            .iter()
            .any(|keyword| self.query.contains(keyword))
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Output(QueryOutput),
    Fail(String),
}

#[derive(Debug, Clone)]
struct Scripted {
    pattern: String,
    reply: Reply,
    persistent: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    script: Vec<Scripted>,
    journal: Vec<Statement>,
    committed: Vec<Statement>,
    commits: usize,
    rollbacks: usize,
}

/// Scripted, transaction-aware in-process driver
///
/// Clones share state, so a test can keep a handle while the driver is
/// borrowed by the code under test.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, pattern: &str, reply: Reply, persistent: bool) -> DriverResult<()> {
        self.write()?.script.push(Scripted {
            pattern: pattern.to_string(),
            reply,
            persistent,
        });
        Ok(())
    }

    /// Answer the next statement containing `pattern` with `output`
    pub fn respond(&self, pattern: &str, output: QueryOutput) -> DriverResult<()> {
        self.push(pattern, Reply::Output(output), false)
    }

    /// Answer every statement containing `pattern` with `output`
    pub fn respond_always(&self, pattern: &str, output: QueryOutput) -> DriverResult<()> {
        self.push(pattern, Reply::Output(output), true)
    }

    /// Fail the next statement containing `pattern`
    pub fn fail_on(&self, pattern: &str, message: &str) -> DriverResult<()> {
        self.push(pattern, Reply::Fail(message.to_string()), false)
    }

    /// Every statement executed so far, committed or not
    pub fn journal(&self) -> DriverResult<Vec<Statement>> {
        Ok(self.read()?.journal.clone())
    }

    /// Statements run outside a transaction or inside a committed one
    pub fn committed(&self) -> DriverResult<Vec<Statement>> {
        Ok(self.read()?.committed.clone())
    }

    pub fn commits(&self) -> DriverResult<usize> {
        Ok(self.read()?.commits)
    }

    pub fn rollbacks(&self) -> DriverResult<usize> {
        Ok(self.read()?.rollbacks)
    }

    /// Journal as pretty JSON, for debugging failed assertions
    pub fn journal_json(&self) -> DriverResult<String> {
        Ok(serde_json::to_string_pretty(&self.read()?.journal)?)
    }

    fn read(&self) -> DriverResult<std::sync::RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|e| DriverError::Lock(format!("Lock error: {}", e)))
    }

    fn write(&self) -> DriverResult<std::sync::RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|e| DriverError::Lock(format!("Lock error: {}", e)))
    }

    /// Record `statement` and produce its scripted reply
    fn answer(&self, statement: &Statement) -> DriverResult<QueryOutput> {
        let mut state = self.write()?;
        state.journal.push(statement.clone());
        tracing::debug!("Executing: {}", statement.query);

        let Some(index) = state
            .script
            .iter()
            .position(|s| statement.query.contains(&s.pattern))
        else {
            return Ok(QueryOutput::default());
        };
        let reply = if state.script[index].persistent {
            state.script[index].reply.clone()
        } else {
            state.script.remove(index).reply
        };
        match reply {
            Reply::Output(output) => Ok(output),
            Reply::Fail(message) => Err(DriverError::Statement(message)),
        }
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn execute(&self, query: &str, params: &Parameters) -> trellis_core::Result<QueryOutput> {
        let statement = Statement {
            query: query.to_string(),
            params: params.clone(),
        };
        let output = self.answer(&statement)?;
        self.write()?.committed.push(statement);
        Ok(output)
    }

    async fn begin_transaction(&self) -> trellis_core::Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            driver: self.clone(),
            pending: Vec::new(),
        }))
    }
}

/// Transaction whose statements reach `committed` only on commit
pub struct MemoryTransaction {
    driver: MemoryDriver,
    pending: Vec<Statement>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn execute(&mut self, query: &str, params: &Parameters) -> trellis_core::Result<QueryOutput> {
        let statement = Statement {
            query: query.to_string(),
            params: params.clone(),
        };
        let output = self.driver.answer(&statement)?;
        self.pending.push(statement);
        Ok(output)
    }

    async fn commit(self: Box<Self>) -> trellis_core::Result<()> {
        let MemoryTransaction { driver, pending } = *self;
        let mut state = driver.write()?;
        state.committed.extend(pending);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> trellis_core::Result<()> {
        let mut state = self.driver.write()?;
        state.rollbacks += 1;
        tracing::debug!("Rolled back {} statements", self.pending.len());
        Ok(())
    }
}
