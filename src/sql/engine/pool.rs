use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::{
    error::{Error, Result},
    sql::{engine::Engine, executor::ResultSet},
};

struct Job {
    workbook: Option<String>,
    sql: String,
    reply: Sender<Result<ResultSet>>,
}

/// Fixed set of threads running statements off a bounded queue
///
/// Each job runs in a fresh session, so statements from different submitters never share a
/// current workbook.
pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `performance.worker_threads` workers with room for `performance.queue_capacity`
    /// waiting jobs
    pub fn new(engine: &Engine) -> Result<Self> {
        let performance = &engine.config().performance;
        let (tx, rx) = crossbeam_channel::bounded::<Job>(performance.queue_capacity.max(1));
        let workers = (0..performance.worker_threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                let engine = engine.clone();
                thread::Builder::new()
                    .name(format!("sheetsql-worker-{}", i))
                    .spawn(move || work(engine, rx))
                    .map_err(|e| Error::Internal(format!("cannot spawn worker: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;
        log::info!("worker pool started with {} threads", workers.len());
        Ok(Self {
            jobs: Some(tx),
            workers,
        })
    }

    /// Queues a statement; the result arrives on the returned receiver. Fails at once when
    /// the queue is full.
    pub fn submit(&self, workbook: Option<&str>, sql: &str) -> Result<Receiver<Result<ResultSet>>> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| Error::Internal("worker pool is shut down".into()))?;
        let (reply, result) = crossbeam_channel::bounded(1);
        let job = Job {
            workbook: workbook.map(str::to_string),
            sql: sql.to_string(),
            reply,
        };
        match jobs.try_send(job) {
            Ok(()) => Ok(result),
            Err(TrySendError::Full(_)) => Err(Error::Internal(
                "query queue is full, try again later".into(),
            )),
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::Internal("worker pool is shut down".into()))
            }
        }
    }

    /// Lets queued jobs finish, then joins every worker
    pub fn shutdown(&mut self) {
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(engine: Engine, jobs: Receiver<Job>) {
    for job in jobs.iter() {
        let mut session = engine.session();
        let result = match &job.workbook {
            Some(workbook) => session.execute_in(&job.sql, workbook),
            None => session.execute(&job.sql),
        };
        // the submitter may have stopped waiting
        let _ = job.reply.send(result);
    }
    log::debug!("worker {:?} stopped", thread::current().name());
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;
    use crate::{
        config::Config,
        error::{Error, Result},
        sql::{engine::Engine, executor::ResultSet, types::Value},
    };

    #[test]
    fn test_submit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let engine = Engine::new(Config::with_base_path(dir.path()))?;
        let mut s = engine.session();
        s.execute("CREATE WORKBOOK w;")?;
        s.execute("CREATE SHEET w.t (n:NUMBER);")?;
        s.execute("INSERT INTO w.t VALUES (1), (2), (3);")?;

        let pool = WorkerPool::new(&engine)?;
        let pending = (0..8)
            .map(|_| pool.submit(Some("w"), "SELECT SUM(n) FROM t;"))
            .collect::<Result<Vec<_>>>()?;
        for rx in pending {
            let result = rx.recv().map_err(|e| Error::Internal(e.to_string()))??;
            assert_eq!(
                result,
                ResultSet::Scan {
                    columns: vec!["SUM(n)".into()],
                    rows: vec![vec![Value::Integer(6)]],
                }
            );
        }

        let rx = pool.submit(None, "SELECT * FROM t;")?;
        assert!(matches!(rx.recv(), Ok(Err(Error::Reference(_)))));
        Ok(())
    }

    #[test]
    fn test_full_queue_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = Config::with_base_path(dir.path());
        config.performance.worker_threads = 1;
        config.performance.queue_capacity = 1;
        let engine = Engine::new(config)?;
        let mut pool = WorkerPool::new(&engine)?;

        // enough submissions that one of them must find the single slot taken
        let rejected = (0..1000)
            .map(|_| pool.submit(None, "SHOW WORKBOOKS;"))
            .filter(|r| matches!(r, Err(Error::Internal(_))))
            .count();
        assert!(rejected > 0);

        pool.shutdown();
        assert!(pool.submit(None, "SHOW WORKBOOKS;").is_err());
        Ok(())
    }
}
