//! Multi-rank launch using shared memory and atomic operations.
//!
//! Replicates the worker function once per local rank. Ranks rendezvous
//! through a shared-memory region keyed off the distributed URL, so workers
//! of the same run find each other whether they live in one process or
//! several on the same host.

use anyhow::{anyhow, bail, Context, Result};
use shared_memory::{Shmem, ShmemConf};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const MAX_WORLD_SIZE: u32 = 64;
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
const FINISH_TIMEOUT: Duration = Duration::from_secs(300);

/// A peer flipped the shared abort flag while this rank was waiting.
///
/// Typed so the launcher can tell abort fallout apart from the failure that
/// caused it and surface the latter.
#[derive(Debug)]
pub struct RendezvousAborted {
    phase: String,
}

impl std::fmt::Display for RendezvousAborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Rendezvous aborted during {}", self.phase)
    }
}

impl std::error::Error for RendezvousAborted {}

impl RendezvousAborted {
    fn during(phase: impl Into<String>) -> anyhow::Error {
        Self {
            phase: phase.into(),
        }
        .into()
    }
}

/// CLI topology flags, one instance per process.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub num_gpus: u32,
    pub num_machines: u32,
    pub machine_rank: u32,
    pub dist_url: String,
}

impl LaunchConfig {
    pub fn world_size(&self) -> u32 {
        self.num_gpus * self.num_machines
    }

    fn validate(&self) -> Result<()> {
        if self.num_gpus == 0 || self.num_machines == 0 {
            bail!("num_gpus and num_machines must be at least 1");
        }
        if self.machine_rank >= self.num_machines {
            bail!(
                "machine_rank {} >= num_machines {}",
                self.machine_rank,
                self.num_machines
            );
        }
        if self.world_size() > MAX_WORLD_SIZE {
            bail!(
                "World size {} > {} (maximum supported)",
                self.world_size(),
                MAX_WORLD_SIZE
            );
        }
        Ok(())
    }
}

/// Identity handed to each replicated worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    pub rank: u32,
    pub local_rank: u32,
    pub world_size: u32,
}

impl WorkerContext {
    /// Rank 0 is the only rank expected to write the output directory.
    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }
}

/// Replicate `worker` across the local ranks of this machine.
///
/// Single-rank runs skip coordination entirely. Multi-rank runs give each
/// rank its own thread and single-threaded runtime; a failing rank flips the
/// shared abort flag so its peers stop waiting instead of timing out.
pub fn launch<F, Fut>(cfg: &LaunchConfig, worker: F) -> Result<()>
where
    F: Fn(WorkerContext) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<()>>,
{
    cfg.validate()?;
    let world_size = cfg.world_size();

    if world_size <= 1 {
        let ctx = WorkerContext {
            rank: 0,
            local_rank: 0,
            world_size: 1,
        };
        return worker_runtime()?.block_on(worker(ctx));
    }

    let rendezvous = rendezvous_id(&cfg.dist_url);
    info!(
        world_size,
        num_gpus = cfg.num_gpus,
        machine_rank = cfg.machine_rank,
        rendezvous = rendezvous.as_str(),
        "launching workers"
    );

    let mut handles = Vec::new();
    for local_rank in 0..cfg.num_gpus {
        let rank = cfg.machine_rank * cfg.num_gpus + local_rank;
        let worker = worker.clone();
        let rendezvous = rendezvous.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rank-{rank}"))
            .spawn(move || -> Result<()> {
                worker_runtime()?.block_on(async move {
                    let coord = RankCoordinator::new(rank, world_size, &rendezvous)?;
                    coord.register_and_wait().await?;
                    coord.barrier("startup").await?;
                    let ctx = WorkerContext {
                        rank,
                        local_rank,
                        world_size,
                    };
                    match worker(ctx).await {
                        Ok(()) => {
                            coord.mark_finished_and_wait().await?;
                            Ok(())
                        }
                        Err(e) => {
                            coord.mark_failed(&e.to_string());
                            coord.abort("worker failed");
                            Err(e)
                        }
                    }
                })
            })
            .context("Failed to spawn rank thread")?;
        handles.push(handle);
    }

    // Prefer the failure that triggered the abort over the abort fallout
    // its peers report while bailing out.
    let mut root_cause: Option<anyhow::Error> = None;
    let mut abort_fallout: Option<anyhow::Error> = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if e.downcast_ref::<RendezvousAborted>().is_some() {
                    abort_fallout.get_or_insert(e);
                } else {
                    root_cause.get_or_insert(e);
                }
            }
            Err(_) => {
                root_cause.get_or_insert(anyhow!("Rank thread panicked"));
            }
        }
    }
    match root_cause.or(abort_fallout) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn worker_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build worker runtime")
}

/// Stable shared-memory key derived from the rendezvous URL.
fn rendezvous_id(dist_url: &str) -> String {
    let mut hasher = DefaultHasher::new();
    dist_url.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Shared coordination state between all ranks.
#[repr(C)]
struct CoordinationState {
    world_size: AtomicU32,
    registered_ranks: AtomicU32,
    finished_ranks: AtomicU32,
    abort: AtomicBool,
    /// Per-rank status (0=not_started, 1=ready, 2=at_barrier, 3=finished, 4=failed)
    rank_status: [AtomicU32; MAX_WORLD_SIZE as usize],
    rank_heartbeats: [AtomicU64; MAX_WORLD_SIZE as usize],
}

impl CoordinationState {
    fn new(world_size: u32) -> Self {
        const INIT_U32: AtomicU32 = AtomicU32::new(0);
        const INIT_U64: AtomicU64 = AtomicU64::new(0);
        Self {
            world_size: AtomicU32::new(world_size),
            registered_ranks: AtomicU32::new(0),
            finished_ranks: AtomicU32::new(0),
            abort: AtomicBool::new(false),
            rank_status: [INIT_U32; MAX_WORLD_SIZE as usize],
            rank_heartbeats: [INIT_U64; MAX_WORLD_SIZE as usize],
        }
    }
}

/// One rank's handle on the shared rendezvous region.
pub struct RankCoordinator {
    rank: u32,
    world_size: u32,
    _shared_mem: Shmem, // keeps the mapping alive
    state: &'static CoordinationState,
    rendezvous: String,
}

impl RankCoordinator {
    /// Create or join the rendezvous group for this run.
    pub fn new(rank: u32, world_size: u32, rendezvous: &str) -> Result<Self> {
        if rank >= world_size {
            bail!("Rank {} >= world_size {}", rank, world_size);
        }
        if world_size > MAX_WORLD_SIZE {
            bail!("World size {} > {} (maximum supported)", world_size, MAX_WORLD_SIZE);
        }

        let shmem_name = format!("vitdet_rv_{}", rendezvous);
        let shmem_size = std::mem::size_of::<CoordinationState>();

        let (shared_mem, is_creator) = match ShmemConf::new()
            .size(shmem_size)
            .os_id(&shmem_name)
            .open()
        {
            Ok(shmem) => {
                debug!(rank, "joined existing rendezvous group");
                (shmem, false)
            }
            Err(_) => match ShmemConf::new()
                .size(shmem_size)
                .os_id(&shmem_name)
                .create()
            {
                Ok(shmem) => {
                    debug!(rank, "created rendezvous group");
                    (shmem, true)
                }
                // A peer won the create race between our open and create.
                Err(_) => {
                    let shmem = ShmemConf::new()
                        .size(shmem_size)
                        .os_id(&shmem_name)
                        .open()
                        .with_context(|| {
                            format!("Failed to open shared memory: {}", shmem_name)
                        })?;
                    debug!(rank, "joined rendezvous group after create race");
                    (shmem, false)
                }
            },
        };

        let state_ptr = shared_mem.as_ptr() as *mut CoordinationState;
        if is_creator {
            unsafe {
                std::ptr::write(state_ptr, CoordinationState::new(world_size));
            }
        }
        let state = unsafe { &*state_ptr };

        // A fresh segment is zeroed; wait out the creator's initialization.
        let init_wait = Instant::now();
        let existing_world_size = loop {
            let ws = state.world_size.load(Ordering::Acquire);
            if ws != 0 {
                break ws;
            }
            if init_wait.elapsed() > REGISTRATION_TIMEOUT {
                bail!("Timed out waiting for rendezvous initialization");
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        if existing_world_size != world_size {
            bail!(
                "World size mismatch at rendezvous: expected {}, found {}",
                world_size,
                existing_world_size
            );
        }

        Ok(Self {
            rank,
            world_size,
            _shared_mem: shared_mem,
            state,
            rendezvous: rendezvous.to_string(),
        })
    }

    /// Register this rank and wait for the whole world to register.
    pub async fn register_and_wait(&self) -> Result<()> {
        self.state.rank_status[self.rank as usize].store(1, Ordering::Release);
        self.update_heartbeat();
        let registered = self.state.registered_ranks.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(rank = self.rank, registered, world_size = self.world_size, "registered");

        let start_wait = Instant::now();
        loop {
            let current = self.state.registered_ranks.load(Ordering::Acquire);
            if current >= self.world_size {
                break;
            }
            if self.check_abort() {
                return Err(RendezvousAborted::during("registration"));
            }
            self.update_heartbeat();
            tokio::time::sleep(Duration::from_millis(100)).await;
            if start_wait.elapsed() > REGISTRATION_TIMEOUT {
                warn!(
                    rank = self.rank,
                    registered = current,
                    world_size = self.world_size,
                    "registration timeout"
                );
                bail!(
                    "Rendezvous timeout: {}/{} ranks registered",
                    current,
                    self.world_size
                );
            }
        }
        info!(rank = self.rank, rendezvous = self.rendezvous.as_str(), "all ranks registered");
        Ok(())
    }

    /// Wait until every rank reaches this point.
    pub async fn barrier(&self, name: &str) -> Result<()> {
        self.state.rank_status[self.rank as usize].store(2, Ordering::Release);
        self.update_heartbeat();

        let start_wait = Instant::now();
        loop {
            let ready = (0..self.world_size)
                .filter(|&i| self.state.rank_status[i as usize].load(Ordering::Acquire) >= 2)
                .count() as u32;
            if ready >= self.world_size {
                break;
            }
            if self.check_abort() {
                return Err(RendezvousAborted::during(format!("barrier '{}'", name)));
            }
            self.update_heartbeat();
            tokio::time::sleep(Duration::from_millis(100)).await;
            if start_wait.elapsed() > REGISTRATION_TIMEOUT {
                bail!(
                    "Timeout at barrier '{}': {}/{} ranks ready",
                    name,
                    ready,
                    self.world_size
                );
            }
        }

        // Each rank resets its own slot for the next barrier.
        self.state.rank_status[self.rank as usize].store(1, Ordering::Release);
        debug!(rank = self.rank, barrier = name, "barrier passed");
        Ok(())
    }

    /// Mark this rank finished and wait for its peers.
    pub async fn mark_finished_and_wait(&self) -> Result<()> {
        self.state.rank_status[self.rank as usize].store(3, Ordering::Release);
        self.update_heartbeat();
        let finished = self.state.finished_ranks.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(rank = self.rank, finished, world_size = self.world_size, "finished");

        let start_wait = Instant::now();
        while self.state.finished_ranks.load(Ordering::Acquire) < self.world_size {
            if self.check_abort() {
                return Err(RendezvousAborted::during("finish wait"));
            }
            self.update_heartbeat();
            tokio::time::sleep(Duration::from_millis(100)).await;
            if start_wait.elapsed() > FINISH_TIMEOUT {
                bail!("Timeout waiting for all ranks to finish");
            }
        }
        info!(rank = self.rank, "all ranks finished");
        Ok(())
    }

    pub fn mark_failed(&self, error: &str) {
        warn!(rank = self.rank, error, "rank failed");
        self.state.rank_status[self.rank as usize].store(4, Ordering::Release);
        self.update_heartbeat();
    }

    pub fn abort(&self, reason: &str) {
        warn!(rank = self.rank, reason, "triggering abort");
        self.state.abort.store(true, Ordering::Release);
    }

    pub fn check_abort(&self) -> bool {
        self.state.abort.load(Ordering::Acquire)
    }

    fn update_heartbeat(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.state.rank_heartbeats[self.rank as usize].store(now, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_coordinator_single_rank_lifecycle() {
        let coord = RankCoordinator::new(0, 1, "test_single_rank").unwrap();
        coord.register_and_wait().await.unwrap();
        coord.barrier("startup").await.unwrap();
        coord.mark_finished_and_wait().await.unwrap();
        assert!(!coord.check_abort());
    }

    #[test]
    fn test_launch_single_rank_runs_worker_inline() {
        let cfg = LaunchConfig {
            num_gpus: 1,
            num_machines: 1,
            machine_rank: 0,
            dist_url: "auto".to_string(),
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        launch(&cfg, move |ctx| {
            let calls = Arc::clone(&calls_clone);
            async move {
                assert_eq!(ctx.rank, 0);
                assert_eq!(ctx.world_size, 1);
                assert!(ctx.is_main_process());
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_launch_surfaces_failing_rank_error() {
        let cfg = LaunchConfig {
            num_gpus: 2,
            num_machines: 1,
            machine_rank: 0,
            dist_url: "tcp://127.0.0.1:29997".to_string(),
        };
        let err = launch(&cfg, |ctx| async move {
            if ctx.rank == 1 {
                anyhow::bail!("worker exploded on rank 1");
            }
            Ok(())
        })
        .unwrap_err();
        // Rank 0 bails with abort fallout while waiting to finish; the
        // launcher must still report rank 1's failure.
        assert!(err.to_string().contains("worker exploded on rank 1"));
    }

    #[test]
    fn test_launch_validates_topology() {
        let cfg = LaunchConfig {
            num_gpus: 2,
            num_machines: 1,
            machine_rank: 1,
            dist_url: "auto".to_string(),
        };
        let err = launch(&cfg, |_ctx| async { Ok::<(), anyhow::Error>(()) }).unwrap_err();
        assert!(err.to_string().contains("machine_rank"));
    }

    #[test]
    fn test_rendezvous_id_is_stable() {
        assert_eq!(
            rendezvous_id("tcp://127.0.0.1:29500"),
            rendezvous_id("tcp://127.0.0.1:29500")
        );
        assert_ne!(
            rendezvous_id("tcp://127.0.0.1:29500"),
            rendezvous_id("tcp://127.0.0.1:29501")
        );
    }
}
