//! Runtime layout: one single-threaded scheduler per shard, plus a small
//! control-plane runtime.
//!
//! Each shard runs a dedicated OS thread driving a current-thread tokio
//! runtime. A task on a shard runs to its next suspension point without
//! preemption by other tasks on the same shard, so shard-local state needs no
//! locking beyond "runs on one core." The control-plane runtime hosts the
//! admin surface and bootstrap coordination; separating it keeps shard
//! saturation from starving administrative traffic.

use std::io;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::types::ShardId;

/// Configuration for the runtime layout.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads for the control-plane runtime.
    ///
    /// Control plane hosts the admin surface and node lifecycle coordination;
    /// low-throughput but latency-sensitive.
    ///
    /// Default: 2
    pub control_plane_threads: usize,

    /// Thread name for control-plane workers.
    pub control_plane_thread_name: String,

    /// Prefix for shard thread names ("shard-0", "shard-1", ...).
    pub shard_thread_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control_plane_threads: 2,
            control_plane_thread_name: "ctrl".to_string(),
            shard_thread_prefix: "shard".to_string(),
        }
    }
}

/// The control-plane runtime, owned by the node.
pub struct ControlRuntime {
    runtime: Runtime,
}

impl ControlRuntime {
    pub fn new(config: &RuntimeConfig) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.control_plane_threads)
            .thread_name(&config.control_plane_thread_name)
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    /// Cloneable handle for spawning control-plane tasks.
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// Block the calling thread on a control-plane future.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// A single-threaded runtime pinned to one shard.
///
/// The runtime is built on the bootstrapping thread (so a build failure is a
/// diagnosable start-up error) and then moved onto the shard's dedicated
/// thread, which drives it for the shard's entire lifetime.
pub struct ShardRuntime {
    shard: ShardId,
    runtime: Runtime,
}

impl ShardRuntime {
    pub fn new(shard: ShardId) -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { shard, runtime })
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Consume the runtime and drive `future` on a dedicated named thread.
    ///
    /// The thread ends when the future completes; dropping the runtime there
    /// cancels any tasks the shard spawned but never joined.
    pub fn run<F>(self, prefix: &str, future: F) -> io::Result<std::thread::JoinHandle<()>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = format!("{}-{}", prefix, self.shard);
        let runtime = self.runtime;
        std::thread::Builder::new().name(name).spawn(move || {
            runtime.block_on(future);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.control_plane_threads, 2);
        assert_eq!(config.control_plane_thread_name, "ctrl");
        assert_eq!(config.shard_thread_prefix, "shard");
    }

    #[test]
    fn test_control_runtime_block_on() {
        let rt = ControlRuntime::new(&RuntimeConfig::default()).unwrap();
        assert_eq!(rt.block_on(async { 42 }), 42);
    }

    #[test]
    fn test_shard_runtime_runs_future_on_named_thread() {
        let rt = ShardRuntime::new(3).unwrap();
        assert_eq!(rt.shard(), 3);

        let (tx, rx) = std::sync::mpsc::channel();
        let handle = rt
            .run("shard", async move {
                let name = std::thread::current().name().map(str::to_string);
                let _ = tx.send(name);
            })
            .unwrap();

        let name = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("shard-3"));
        handle.join().unwrap();
    }

    #[test]
    fn test_shard_runtime_thread_ends_with_future() {
        let rt = ShardRuntime::new(0).unwrap();
        let handle = rt.run("shard", async {}).unwrap();
        handle.join().unwrap();
    }
}
