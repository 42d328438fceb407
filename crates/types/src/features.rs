//! Host capability probing.
//!
//! Backends consult this once at thread construction; none of the flags may
//! change while a context is live.

/// Host CPU capabilities relevant to code generation.
#[derive(Clone, Copy, Debug)]
pub struct HostFeatures {
    /// Hardware compare-and-swap (AArch64 LSE). Without it the backend
    /// emits load-linked/store-conditional loops.
    pub supports_atomic_cas: bool,
    /// Host vectors are 256 bits wide; otherwise the engine runs the
    /// 128-bit fall-back vector layout.
    pub supports_256bit_simd: bool,
    /// Host loads/stores are naturally TSO; fences for guest TSO accesses
    /// can be elided.
    pub host_is_tso: bool,
    /// CRC32 instructions available for code hashing fast paths.
    pub supports_crc: bool,
}

impl HostFeatures {
    pub fn detect() -> HostFeatures {
        detect_host()
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        fn detect_host() -> HostFeatures {
            HostFeatures {
                supports_atomic_cas: true,
                supports_256bit_simd: std::arch::is_x86_feature_detected!("avx2"),
                host_is_tso: true,
                supports_crc: std::arch::is_x86_feature_detected!("sse4.2"),
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        fn detect_host() -> HostFeatures {
            HostFeatures {
                supports_atomic_cas: std::arch::is_aarch64_feature_detected!("lse"),
                supports_256bit_simd: false,
                host_is_tso: false,
                supports_crc: std::arch::is_aarch64_feature_detected!("crc"),
            }
        }
    } else {
        fn detect_host() -> HostFeatures {
            HostFeatures {
                supports_atomic_cas: false,
                supports_256bit_simd: false,
                host_is_tso: false,
                supports_crc: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_does_not_panic() {
        let features = HostFeatures::detect();
        // TSO hosts always have hardware CAS.
        if features.host_is_tso {
            assert!(features.supports_atomic_cas);
        }
    }
}
