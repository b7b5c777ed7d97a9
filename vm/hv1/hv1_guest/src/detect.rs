// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hyper-V presence and capability detection.

use crate::platform::CpuId;
use crate::platform::MsrAccess;
use hvdef::GuestOsId;
use hvdef::HvPartitionPrivilege;
use hvdef::HvVersion;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("not running under a hypervisor")]
    NotVirtualized,
    #[error("hypervisor maximum cpuid leaf {0:#x} is too low")]
    MaxFunction(u32),
    #[error("hypervisor interface signature {0:#x} is not Hv#1")]
    Signature(u32),
    #[error("hypervisor does not expose {0}")]
    MissingFeature(&'static str),
}

/// What the hypervisor reported about itself.
#[derive(Debug, Clone)]
pub struct HypervisorInfo {
    pub vendor: [u8; 12],
    pub max_function: u32,
    pub version: HvVersion,
    pub privileges: HvPartitionPrivilege,
}

impl HypervisorInfo {
    /// Identifies a Microsoft-compatible hypervisor and checks that the
    /// hypercall and SynIC MSRs are available.
    pub fn detect(cpuid: &dyn CpuId) -> Result<Self, DetectError> {
        let leaf1 = cpuid.cpuid(hvdef::HV_CPUID_FUNCTION_VERSION_AND_FEATURES, 0);
        if leaf1.ecx & hvdef::CPUID_1_ECX_HYPERVISOR_PRESENT == 0 {
            return Err(DetectError::NotVirtualized);
        }

        let vendor = cpuid.cpuid(hvdef::HV_CPUID_FUNCTION_HV_VENDOR_AND_MAX_FUNCTION, 0);
        if vendor.eax < hvdef::HV_CPUID_MINIMUM_MAX_FUNCTION {
            return Err(DetectError::MaxFunction(vendor.eax));
        }
        let mut vendor_id = [0; 12];
        vendor_id[..4].copy_from_slice(&vendor.ebx.to_le_bytes());
        vendor_id[4..8].copy_from_slice(&vendor.ecx.to_le_bytes());
        vendor_id[8..].copy_from_slice(&vendor.edx.to_le_bytes());

        let interface = cpuid.cpuid(hvdef::HV_CPUID_FUNCTION_HV_INTERFACE, 0);
        if interface.eax != hvdef::HV_INTERFACE_SIGNATURE_HV1 {
            return Err(DetectError::Signature(interface.eax));
        }

        let v = cpuid.cpuid(hvdef::HV_CPUID_FUNCTION_MS_HV_VERSION, 0);
        let version = HvVersion::from_cpuid(v.eax, v.ebx, v.ecx, v.edx);

        let features = cpuid.cpuid(hvdef::HV_CPUID_FUNCTION_MS_HV_FEATURES, 0);
        let privileges =
            HvPartitionPrivilege::from(features.eax as u64 | (features.ebx as u64) << 32);
        if !privileges.access_hypercall_msrs() {
            return Err(DetectError::MissingFeature("the hypercall MSRs"));
        }
        if !privileges.access_synic_msrs() {
            return Err(DetectError::MissingFeature("the SynIC MSRs"));
        }

        let info = Self {
            vendor: vendor_id,
            max_function: vendor.eax,
            version,
            privileges,
        };
        tracing::info!(
            vendor = %String::from_utf8_lossy(&info.vendor),
            major = version.major,
            minor = version.minor,
            build = version.build,
            max_function = info.max_function,
            privileges = u64::from(privileges),
            "detected hypervisor"
        );
        Ok(info)
    }

    pub fn can_post_messages(&self) -> bool {
        self.privileges.post_messages()
    }
}

/// Identifies the guest to the hypervisor. Must precede enabling the
/// hypercall page.
pub fn report_guest_os_id(msr: &dyn MsrAccess, id: GuestOsId) {
    tracing::debug!(id = u64::from(id), "reporting guest OS id");
    msr.write_msr(hvdef::HV_X64_MSR_GUEST_OS_ID, id.into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::CpuIdResult;
    use test_with_tracing::test;

    struct FixedCpuid {
        max: u32,
        signature: u32,
        eax_features: u32,
    }

    impl CpuId for FixedCpuid {
        fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuIdResult {
            match leaf {
                1 => CpuIdResult {
                    ecx: 1 << 31,
                    ..Default::default()
                },
                0x40000000 => CpuIdResult {
                    eax: self.max,
                    ebx: u32::from_le_bytes(*b"Micr"),
                    ecx: u32::from_le_bytes(*b"osof"),
                    edx: u32::from_le_bytes(*b"t Hv"),
                },
                0x40000001 => CpuIdResult {
                    eax: self.signature,
                    ..Default::default()
                },
                0x40000002 => CpuIdResult {
                    eax: 20348,
                    ebx: 10 << 16,
                    ..Default::default()
                },
                0x40000003 => CpuIdResult {
                    eax: self.eax_features,
                    ebx: 1 << 4,
                    ..Default::default()
                },
                _ => CpuIdResult::default(),
            }
        }
    }

    const SYNIC_AND_HYPERCALL: u32 = 0x4 | 0x20;

    #[test]
    fn detects_hyperv() {
        let info = HypervisorInfo::detect(&FixedCpuid {
            max: 0x40000006,
            signature: 0x31237648,
            eax_features: SYNIC_AND_HYPERCALL,
        })
        .unwrap();
        assert_eq!(&info.vendor, b"Microsoft Hv");
        assert_eq!(info.version.major, 10);
        assert!(info.can_post_messages());
    }

    #[test]
    fn rejects_low_max_leaf_and_bad_signature() {
        let err = HypervisorInfo::detect(&FixedCpuid {
            max: 0x40000004,
            signature: 0x31237648,
            eax_features: SYNIC_AND_HYPERCALL,
        })
        .unwrap_err();
        assert!(matches!(err, DetectError::MaxFunction(0x40000004)));

        let err = HypervisorInfo::detect(&FixedCpuid {
            max: 0x40000005,
            signature: 0x30237648,
            eax_features: SYNIC_AND_HYPERCALL,
        })
        .unwrap_err();
        assert!(matches!(err, DetectError::Signature(_)));
    }

    #[test]
    fn requires_hypercall_msr() {
        let err = HypervisorInfo::detect(&FixedCpuid {
            max: 0x40000005,
            signature: 0x31237648,
            eax_features: 0x4,
        })
        .unwrap_err();
        assert!(matches!(err, DetectError::MissingFeature(_)));
    }
}
