//! GTID apply protocol
//!
//! Per transaction, on a worker's exclusively-owned connection:
//!
//! 1. Execute the FDE standalone when it differs from the last one applied
//!    on this connection (memoized session-locally, reset on reconnect).
//! 2. `SET GTID_NEXT = '<gtid>'` to bind the next transaction boundary to
//!    the upstream identity.
//! 3. `BEGIN`, replay every statement in order.
//! 4. `COMMIT` - a server-side no-op when the GTID is already executed,
//!    which is how at-least-once delivery is tolerated.
//! 5. `SET GTID_NEXT = 'AUTOMATIC'` to release the binding.
//!
//! Failures before the binding is taken leave the connection clean; any
//! failure between `BEGIN` and the unbind taints it. A tainted connection is
//! terminal: the worker closes and replaces it.

use gtid_relay_core::{Gtid, Transaction};
use tracing::debug;

use crate::error::{ApplierError, Result};
use crate::sql::SqlConn;

/// Per-connection apply state machine.
pub struct TxnApplier {
    conn: Box<dyn SqlConn>,
    last_fde: Option<String>,
    tainted: bool,
}

impl TxnApplier {
    pub fn new(conn: Box<dyn SqlConn>) -> Self {
        Self {
            conn,
            last_fde: None,
            tainted: false,
        }
    }

    /// Whether the connection holds (or may hold) a stale GTID binding and
    /// must be replaced.
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Swap in a fresh connection after taint, clearing session-local state.
    pub fn replace(&mut self, conn: Box<dyn SqlConn>) {
        self.conn = conn;
        self.last_fde = None;
        self.tainted = false;
    }

    pub async fn close(&mut self) -> Result<()> {
        self.conn.close().await
    }

    /// Replay one transaction, returning its GTID on commit.
    pub async fn apply(&mut self, txn: &Transaction) -> Result<Gtid> {
        if self.tainted {
            return Err(ApplierError::ConnectionClosed);
        }
        // Empty transactions are filtered at intake.
        debug_assert!(!txn.queries.is_empty());

        // Validate before touching the connection so a malformed GTID fails
        // only this message.
        let gtid: Gtid = txn.gtid.parse()?;

        if !txn.fde.is_empty() && self.last_fde.as_deref() != Some(txn.fde.as_str()) {
            self.conn.exec(&txn.fde).await?;
            self.last_fde = Some(txn.fde.clone());
            debug!("applied new format description event");
        }

        self.conn
            .exec(&format!("SET GTID_NEXT = '{gtid}'"))
            .await?;

        // The binding is now held; from here until AUTOMATIC any failure
        // leaves the session in an unknown state.
        if let Err(e) = self.replay(txn).await {
            self.tainted = true;
            return Err(e);
        }

        Ok(gtid)
    }

    async fn replay(&mut self, txn: &Transaction) -> Result<()> {
        self.conn.exec("BEGIN").await?;
        for query in &txn.queries {
            self.conn.exec(query).await?;
        }
        self.conn.exec("COMMIT").await?;
        self.conn.exec("SET GTID_NEXT = 'AUTOMATIC'").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Script {
        executed: Vec<String>,
        fail_on: Option<String>,
    }

    #[derive(Clone, Default)]
    struct ScriptedConn {
        script: Arc<Mutex<Script>>,
    }

    impl ScriptedConn {
        fn executed(&self) -> Vec<String> {
            self.script.lock().executed.clone()
        }

        fn fail_on(&self, needle: &str) {
            self.script.lock().fail_on = Some(needle.to_string());
        }
    }

    #[async_trait]
    impl SqlConn for ScriptedConn {
        async fn exec(&mut self, stmt: &str) -> Result<()> {
            let mut script = self.script.lock();
            if script.fail_on.as_deref().is_some_and(|f| stmt.contains(f)) {
                return Err(ApplierError::sql(format!("forced failure on {stmt}")));
            }
            script.executed.push(stmt.to_string());
            Ok(())
        }

        async fn query_scalar(&mut self, _stmt: &str) -> Result<Option<String>> {
            Ok(Some("ON".to_string()))
        }

        async fn ping(&mut self) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    const GTID: &str = "11111111-1111-1111-1111-111111111111:5";

    fn txn(fde: &str, queries: &[&str]) -> Transaction {
        Transaction {
            gtid: GTID.to_string(),
            fde: fde.to_string(),
            queries: queries.iter().map(|q| q.to_string()).collect(),
            event_size: 64,
            last_committed: None,
        }
    }

    #[tokio::test]
    async fn test_apply_statement_sequence() {
        let conn = ScriptedConn::default();
        let mut applier = TxnApplier::new(Box::new(conn.clone()));

        let gtid = applier
            .apply(&txn("BINLOG 'fde'", &["CREATE TABLE t(x INT)"]))
            .await
            .unwrap();
        assert_eq!(gtid.to_string(), GTID);

        let expected: Vec<String> = vec![
            "BINLOG 'fde'".to_string(),
            format!("SET GTID_NEXT = '{GTID}'"),
            "BEGIN".to_string(),
            "CREATE TABLE t(x INT)".to_string(),
            "COMMIT".to_string(),
            "SET GTID_NEXT = 'AUTOMATIC'".to_string(),
        ];
        assert_eq!(conn.executed(), expected);
    }

    #[tokio::test]
    async fn test_fde_applied_once_across_transactions() {
        let conn = ScriptedConn::default();
        let mut applier = TxnApplier::new(Box::new(conn.clone()));

        applier.apply(&txn("BINLOG 'v1'", &["Q1"])).await.unwrap();
        applier.apply(&txn("BINLOG 'v1'", &["Q2"])).await.unwrap();
        applier.apply(&txn("BINLOG 'v2'", &["Q3"])).await.unwrap();

        let fdes: Vec<_> = conn
            .executed()
            .into_iter()
            .filter(|s| s.starts_with("BINLOG"))
            .collect();
        assert_eq!(fdes, vec!["BINLOG 'v1'", "BINLOG 'v2'"]);
    }

    #[tokio::test]
    async fn test_empty_fde_is_not_executed() {
        let conn = ScriptedConn::default();
        let mut applier = TxnApplier::new(Box::new(conn.clone()));
        applier.apply(&txn("", &["Q1"])).await.unwrap();
        assert!(!conn.executed().iter().any(|s| s.is_empty()));
    }

    #[tokio::test]
    async fn test_bad_gtid_fails_without_sql() {
        let conn = ScriptedConn::default();
        let mut applier = TxnApplier::new(Box::new(conn.clone()));

        let mut bad = txn("", &["Q1"]);
        bad.gtid = "not-a-gtid".to_string();
        assert!(matches!(
            applier.apply(&bad).await,
            Err(ApplierError::Gtid(_))
        ));
        assert!(conn.executed().is_empty());
        assert!(!applier.is_tainted());
    }

    #[tokio::test]
    async fn test_gtid_bind_failure_does_not_taint() {
        let conn = ScriptedConn::default();
        conn.fail_on("SET GTID_NEXT = '1");
        let mut applier = TxnApplier::new(Box::new(conn.clone()));

        assert!(applier.apply(&txn("", &["Q1"])).await.is_err());
        assert!(!applier.is_tainted());
    }

    #[tokio::test]
    async fn test_query_failure_taints_connection() {
        let conn = ScriptedConn::default();
        conn.fail_on("Q2");
        let mut applier = TxnApplier::new(Box::new(conn.clone()));

        assert!(applier.apply(&txn("", &["Q1", "Q2"])).await.is_err());
        assert!(applier.is_tainted());

        // The unbind must not have been emitted on the tainted session.
        assert!(!conn
            .executed()
            .iter()
            .any(|s| s.contains("AUTOMATIC")));

        // A tainted applier refuses further work until replaced.
        assert!(applier.apply(&txn("", &["Q3"])).await.is_err());
    }

    #[tokio::test]
    async fn test_replace_resets_session_state() {
        let conn = ScriptedConn::default();
        conn.fail_on("Q2");
        let mut applier = TxnApplier::new(Box::new(conn.clone()));
        assert!(applier.apply(&txn("BINLOG 'v1'", &["Q2"])).await.is_err());
        assert!(applier.is_tainted());

        let fresh = ScriptedConn::default();
        applier.replace(Box::new(fresh.clone()));
        assert!(!applier.is_tainted());

        // The FDE memo was cleared with the old session.
        applier.apply(&txn("BINLOG 'v1'", &["Q1"])).await.unwrap();
        assert!(fresh.executed().contains(&"BINLOG 'v1'".to_string()));
    }

    #[tokio::test]
    async fn test_commit_failure_taints() {
        let conn = ScriptedConn::default();
        conn.fail_on("COMMIT");
        let mut applier = TxnApplier::new(Box::new(conn.clone()));

        assert!(applier.apply(&txn("", &["Q1"])).await.is_err());
        assert!(applier.is_tainted());
    }
}
