extern crate crossbeam_ebr;
extern crate crossbeam_utils;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate cfg_if;
extern crate typenum;

pub mod config;
pub mod ds_impl;
pub mod error;

pub use error::{Error, Result};

cfg_if! {
    if #[cfg(target_os = "linux")] {
        extern crate tikv_jemalloc_ctl;
        use log::warn;

        /// Reads jemalloc's `stats.allocated` counter.
        pub struct MemSampler {
            mibs: Option<(
                tikv_jemalloc_ctl::epoch_mib,
                tikv_jemalloc_ctl::stats::allocated_mib,
            )>,
        }

        impl MemSampler {
            pub fn new() -> Self {
                let mibs = tikv_jemalloc_ctl::epoch::mib()
                    .and_then(|epoch| Ok((epoch, tikv_jemalloc_ctl::stats::allocated::mib()?)));
                if let Err(e) = &mibs {
                    warn!("jemalloc stats are unavailable: {}", e);
                }
                MemSampler { mibs: mibs.ok() }
            }

            pub fn sample(&self) -> usize {
                let Some((epoch, allocated)) = &self.mibs else {
                    return 0;
                };
                match epoch.advance().and_then(|_| allocated.read()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("failed to sample jemalloc stats: {}", e);
                        0
                    }
                }
            }
        }
    } else {
        pub struct MemSampler {}

        impl MemSampler {
            pub fn new() -> Self {
                println!("NOTE: Memory usage benchmark is supported only for linux.");
                MemSampler {}
            }

            pub fn sample(&self) -> usize {
                0
            }
        }
    }
}

impl Default for MemSampler {
    fn default() -> Self {
        Self::new()
    }
}
