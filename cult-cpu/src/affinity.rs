//! Thread affinity. Measurements are only meaningful if the thread
//! stays on one logical CPU: TSC values are per-package but migrations
//! add scheduler noise, and per-core boost states differ.

/// Pins the current thread to the given logical CPU.
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(cpu: usize) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// On platforms without a usable affinity call the pin is skipped; the
/// minimum-taking measurement loop has to absorb migrations on its own.
#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(cpu: usize) -> std::io::Result<()> {
    log::warn!("thread affinity not supported on this platform; cannot pin to CPU {cpu}");
    Ok(())
}
