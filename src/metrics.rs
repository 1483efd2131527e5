use std::sync::{Mutex, OnceLock};
use sysinfo::{MemoryRefreshKind, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub process_mb: u64,
    pub used_mb: u64,
    pub avail_mb: u64,
}

static SYS: OnceLock<Mutex<System>> = OnceLock::new();

fn sys_handle() -> &'static Mutex<System> {
    SYS.get_or_init(|| {
        Mutex::new(System::new_with_specifics(
            RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
        ))
    })
}

/// Host memory plus resident size of this process, in MB. Zeroes when the
/// platform cannot report.
pub fn memory_stats_mb() -> MemoryStats {
    let Ok(mut sys) = sys_handle().lock() else {
        return MemoryStats::default();
    };
    sys.refresh_memory();
    let total_mb = sys.total_memory() / (1024 * 1024);
    let avail_mb = sys.available_memory() / (1024 * 1024);
    let process_mb = match sysinfo::get_current_pid() {
        Ok(pid) => {
            sys.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_memory(),
            );
            sys.process(pid).map(|p| p.memory() / (1024 * 1024)).unwrap_or(0)
        }
        Err(_) => 0,
    };
    MemoryStats {
        process_mb,
        used_mb: total_mb.saturating_sub(avail_mb),
        avail_mb,
    }
}
