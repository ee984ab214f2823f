//! The executor module manages the tokio runtime that drives pending
//! exceptions: each in-flight chunk copy is one task, which only
//! wakes up when the copy engine or the exception store calls back.
use std::future::Future;
use tokio::runtime;
use tokio::runtime::Handle;
use tokio::runtime::Runtime;

use crate::chain_error;
use crate::result::Result;

/// Owns the runtime; handles given to snapshots do not keep it alive.
#[derive(Debug)]
pub(crate) struct Executor {
    // Only `None` while dropping.
    runtime: Option<Runtime>,
}

impl Executor {
    /// Creates a runtime with `num_threads` worker threads.
    pub fn new(num_threads: usize) -> Result<Executor> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(num_threads.max(1))
            .thread_name("cowsnap-exception")
            .build()
            .map_err(|e| chain_error!(e, "failed to create tokio runtime", num_threads))?;

        Ok(Executor {
            runtime: Some(runtime),
        })
    }

    pub fn handle(&self) -> Handle {
        self.runtime
            .as_ref()
            .expect("runtime is only taken on drop")
            .handle()
            .clone()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // The last registry reference may go away on a runtime
        // thread, where blocking on shutdown would panic.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Spawns `task` on the runtime behind `handle`.
pub(crate) fn spawn_on<F>(handle: &Handle, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    // Tasks report through their own channels; nobody joins them.
    let _ = handle.spawn(task);
}

#[test]
fn test_spawn() {
    let executor = Executor::new(2).expect("should build runtime");
    let (sender, receiver) = crossbeam_channel::unbounded();

    spawn_on(&executor.handle(), async move {
        sender.send(42).expect("receiver alive");
    });

    assert_eq!(
        receiver
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("task must run"),
        42
    );
}
