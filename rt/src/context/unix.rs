#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::initial_frame;

#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::initial_frame;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("context switching is only supported on x86-64 and AArch64");
