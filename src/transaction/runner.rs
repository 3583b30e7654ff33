use std::{sync::Arc, time::Instant};

use log::{debug, info, warn};

use crate::{
    backoff::{RetryBudget, deadline_after},
    error::{Error, Result},
    protocol::{CommitResponse, Rpc},
    request_id::RequestIdGenerator,
    session::{OperationKind, SessionFactory},
};

use super::{
    TransactionOptions,
    attempt::{Attempt, Transaction},
};

/// Drives a transaction function to a successful commit.
///
/// Aborted attempts are retried on the same session after a backoff. A session
/// the server no longer knows is invalidated and the function is retried on a
/// fresh one. Every other failure rolls the attempt back and is returned.
pub(crate) struct TransactionRunner<'a> {
    pub rpc: &'a Arc<dyn Rpc>,
    pub ids: &'a RequestIdGenerator,
    pub factory: &'a SessionFactory,
    pub options: TransactionOptions,
}

impl TransactionRunner<'_> {
    #[track_caller]
    pub fn run<T, F>(&self, mut work: F) -> Result<(T, CommitResponse)>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        let deadline = deadline_after(self.options.timeout);
        let scope = Arc::new(self.ids.next_request());
        let mut retry = RetryBudget::new(self.options.backoff.clone(), Some(deadline));
        let mut session = self
            .factory
            .session(OperationKind::ReadWrite, Some(deadline))?;
        let mut previous_id = None;
        let mut explicit_begin = false;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let txn = Transaction::new(Attempt {
                rpc: Arc::clone(self.rpc),
                scope: Arc::clone(&scope),
                session: session.name().clone(),
                multiplexed: session.is_multiplexed(),
                options: self.options.clone(),
                previous_id: previous_id.take(),
                explicit_begin,
                deadline,
            });
            debug!("transaction attempt {attempts} on {}", session.name());

            let err = match work(&txn).and_then(|value| Ok((value, txn.commit()?))) {
                Ok(done) => {
                    if attempts > 1 {
                        info!("transaction committed after {attempts} attempts");
                    }
                    return Ok(done);
                }
                Err(err) => err,
            };

            if err.is_aborted() {
                debug!("attempt {attempts} aborted: {err}");
                if session.is_multiplexed() {
                    previous_id = txn.id();
                }
                explicit_begin = txn.inline_begin_failed();
                retry.pause(err)?;
                continue;
            }

            if err.is_session_not_found() {
                warn!("{} was not found; retrying on a new session", session.name());
                if Instant::now() >= deadline {
                    return Err(Error::DeadlineExceeded {
                        attempts,
                        last: Some(Box::new(err)),
                    });
                }
                session.mark_invalid();
                drop(session);
                session = self
                    .factory
                    .session(OperationKind::ReadWrite, Some(deadline))?;
                explicit_begin = false;
                continue;
            }

            txn.rollback();
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fmt, time::Duration};

    use super::*;
    use crate::{
        backoff::Backoff,
        config::{MultiplexedConfig, PoolConfig},
        error::{Code, Status},
        mock::{Method, MockRpc},
        mutation::{Mutation, Write},
        protocol::{TransactionId, TransactionMode, TransactionSelector},
        request_id::ClientContext,
        session::{MultiplexedSession, SessionKind, SessionName, SessionPool},
    };

    struct Client {
        rpc: Arc<dyn Rpc>,
        ids: Arc<RequestIdGenerator>,
        factory: SessionFactory,
    }

    impl Client {
        fn new(mock: &Arc<MockRpc>, toggles: MultiplexedConfig) -> Self {
            let ids = Arc::new(ClientContext::new().new_client(1));
            let config = PoolConfig {
                min: 1,
                max: 2,
                inc_step: 1,
                ..PoolConfig::default()
            };
            let pool = SessionPool::open(mock.clone(), Arc::clone(&ids), config).unwrap();
            let multiplexed = MultiplexedSession::new(mock.clone(), Arc::clone(&ids), None);
            Self {
                rpc: mock.clone(),
                ids,
                factory: SessionFactory::new(pool, multiplexed, toggles),
            }
        }

        fn pooled(mock: &Arc<MockRpc>) -> Self {
            Self::new(mock, MultiplexedConfig::default())
        }

        fn multiplexed(mock: &Arc<MockRpc>) -> Self {
            Self::new(
                mock,
                MultiplexedConfig {
                    read_write: true,
                    ..MultiplexedConfig::default()
                },
            )
        }

        fn runner(&self, options: TransactionOptions) -> TransactionRunner<'_> {
            TransactionRunner {
                rpc: &self.rpc,
                ids: &self.ids,
                factory: &self.factory,
                options,
            }
        }

        fn run<T>(
            &self,
            work: impl FnMut(&Transaction) -> Result<T>,
        ) -> Result<(T, CommitResponse)> {
            self.runner(fast()).run(work)
        }
    }

    fn fast() -> TransactionOptions {
        TransactionOptions::default()
            .with_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(5)))
    }

    fn aborted() -> Status {
        Status::aborted("conflict").with_retry_delay(Duration::from_millis(1))
    }

    fn singer(id: i64) -> Write {
        Write::new("Singers", ["SingerId", "Name"]).row(vec![id.into(), format!("s{id}").into()])
    }

    #[test]
    fn aborted_commit_reruns_the_function_and_applies_mutations_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mock = MockRpc::new();
        let client = Client::pooled(&mock);
        mock.fail_next(Method::Commit, aborted());

        let mut runs = 0;
        let (value, response) = client
            .run(|txn| {
                runs += 1;
                txn.insert(singer(1));
                Ok("done")
            })
            .unwrap();

        assert_eq!(value, "done");
        assert!(response.commit_timestamp.is_some());
        assert_eq!(runs, 2);
        assert_eq!(mock.calls(Method::Commit), 2);
        assert_eq!(mock.committed(), vec![vec![Mutation::Insert(singer(1))]]);
        assert_eq!(mock.created_sessions(), 1);
    }

    #[test]
    fn aborted_statement_retries_with_an_explicit_begin() {
        let mock = MockRpc::new();
        let client = Client::pooled(&mock);
        mock.fail_next(Method::ExecuteStreamingSql, aborted());

        let (count, _) = client
            .run(|txn| txn.run_update("UPDATE Singers SET Name = 'x'"))
            .unwrap();

        assert_eq!(count, 1);
        assert_eq!(mock.calls(Method::BeginTransaction), 1);
        let sql = mock.sql_requests();
        assert_eq!(sql.len(), 1);
        assert!(matches!(sql[0].transaction, TransactionSelector::Id(_)));
    }

    #[test]
    fn retry_on_a_multiplexed_session_names_the_aborted_transaction() {
        let mock = MockRpc::new();
        let client = Client::multiplexed(&mock);
        mock.fail_next(Method::Commit, aborted());

        client
            .run(|txn| txn.run_update("UPDATE Singers SET Name = 'x'"))
            .unwrap();

        let sql = mock.sql_requests();
        assert_eq!(sql.len(), 2);
        let previous = |selector: &TransactionSelector| match selector {
            TransactionSelector::Begin(options) => match &options.mode {
                TransactionMode::ReadWrite {
                    previous_transaction_id,
                    ..
                } => previous_transaction_id.clone(),
                other => panic!("unexpected mode {other:?}"),
            },
            other => panic!("unexpected selector {other:?}"),
        };
        assert_eq!(previous(&sql[0].transaction), None);
        assert_eq!(
            previous(&sql[1].transaction),
            Some(TransactionId::from("txn-1"))
        );
    }

    #[test]
    fn pooled_retries_send_no_previous_transaction() {
        let mock = MockRpc::new();
        let client = Client::pooled(&mock);
        mock.fail_next(Method::Commit, aborted());

        client
            .run(|txn| txn.run_update("UPDATE Singers SET Name = 'x'"))
            .unwrap();

        for request in mock.sql_requests() {
            match request.transaction {
                TransactionSelector::Begin(options) => assert_eq!(
                    options.mode,
                    TransactionMode::ReadWrite {
                        read_lock_mode: Default::default(),
                        previous_transaction_id: None,
                    }
                ),
                other => panic!("unexpected selector {other:?}"),
            }
        }
    }

    #[test]
    fn missing_session_moves_the_transaction_to_a_new_one() {
        let mock = MockRpc::new();
        let client = Client::pooled(&mock);
        mock.fail_next(
            Method::Commit,
            Status::session_not_found(&SessionName::from("sessions/1")),
        );

        let mut runs = 0;
        client
            .run(|txn| {
                runs += 1;
                txn.insert(singer(2));
                Ok(())
            })
            .unwrap();

        assert_eq!(runs, 2);
        assert_eq!(mock.calls(Method::Commit), 2);
        let commits = mock.commits();
        assert_eq!(commits.len(), 1);
        assert_ne!(commits[0].session, SessionName::from("sessions/1"));
        assert_eq!(mock.committed().len(), 1);
        let status = client.factory.pool().status();
        assert_eq!(status.borrowed, 0);
        assert_eq!(status.size, 1);
    }

    #[derive(Debug)]
    struct Rejected;

    impl fmt::Display for Rejected {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("rejected by the application")
        }
    }

    impl std::error::Error for Rejected {}

    #[test]
    fn other_failures_roll_back_and_surface() {
        let mock = MockRpc::new();
        let client = Client::pooled(&mock);

        let err = client
            .run(|txn| -> Result<()> {
                txn.run_update("UPDATE Singers SET Name = 'x'")?;
                Err(Error::application(Rejected))
            })
            .unwrap_err();

        assert!(matches!(err, Error::Application(_)));
        assert_eq!(mock.rollbacks().len(), 1);
        assert_eq!(mock.calls(Method::Commit), 0);
        assert_eq!(client.factory.pool().status().borrowed, 0);
    }

    #[test]
    fn unavailable_commit_is_not_resent() {
        let mock = MockRpc::new();
        let client = Client::pooled(&mock);
        mock.fail_next(Method::Commit, Status::unavailable("gone"));

        let err = client.run(|txn| txn.run_update("DELETE FROM Singers")).unwrap_err();

        assert_eq!(err.code(), Some(Code::Unavailable));
        assert_eq!(mock.calls(Method::Commit), 1);
        assert!(err.request_id().is_some());
    }

    #[test]
    fn endless_aborts_stop_at_the_deadline() {
        let mock = MockRpc::new();
        let client = Client::pooled(&mock);
        for _ in 0..1000 {
            mock.fail_next(Method::Commit, Status::aborted("conflict"));
        }

        let options = fast()
            .with_timeout(Duration::from_millis(100))
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(10)));
        let err = client
            .runner(options)
            .run(|txn| {
                txn.insert(singer(3));
                Ok(())
            })
            .unwrap_err();

        match err {
            Error::DeadlineExceeded { attempts, last } => {
                assert!(attempts > 1);
                assert!(last.is_some_and(|last| last.is_aborted()));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(mock.committed().is_empty());
        assert_eq!(client.factory.pool().status().borrowed, 0);
    }

    #[test]
    fn deadline_while_waiting_for_a_begin_returns_the_session() {
        let mock = MockRpc::new();
        let client = Client::pooled(&mock);

        let err = client
            .runner(fast().with_timeout(Duration::from_millis(50)))
            .run(|txn| {
                txn.stall_inline_begin();
                txn.run_update("UPDATE Singers SET Name = 'x'")
            })
            .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded { .. }));
        assert_eq!(mock.calls(Method::ExecuteStreamingSql), 0);
        let status = client.factory.pool().status();
        assert_eq!((status.borrowed, status.available), (0, 1));
    }

    #[test]
    fn deadline_while_waiting_for_a_session_leaves_the_pool_intact() {
        let mock = MockRpc::new();
        let client = Client::pooled(&mock);
        let pool = client.factory.pool();
        let held = [
            pool.acquire(SessionKind::ReadWrite).unwrap(),
            pool.acquire(SessionKind::ReadWrite).unwrap(),
        ];

        let mut runs = 0;
        let err = client
            .runner(fast().with_timeout(Duration::from_millis(30)))
            .run(|_| {
                runs += 1;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, Error::AcquireTimeout { .. }));
        assert_eq!(runs, 0);
        assert_eq!(pool.status().waiters, 0);
        drop(held);
        let status = pool.status();
        assert_eq!((status.borrowed, status.available), (0, 2));
    }

    #[test]
    fn attempts_of_one_transaction_share_a_request_generation() {
        let mock = MockRpc::new();
        let client = Client::pooled(&mock);
        mock.fail_next(Method::Commit, aborted());

        client
            .run(|txn| txn.run_update("UPDATE Singers SET Name = 'x'"))
            .unwrap();

        let ids = mock
            .request_ids()
            .into_iter()
            .filter(|(method, _)| {
                matches!(method, Method::ExecuteStreamingSql | Method::Commit)
            })
            .map(|(_, id)| id)
            .collect::<Vec<_>>();
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|id| id.generation == ids[0].generation));
        let mut rpcs = ids.iter().map(|id| id.rpc).collect::<Vec<_>>();
        rpcs.dedup();
        assert_eq!(rpcs.len(), 4);
    }
}
