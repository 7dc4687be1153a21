use log::debug;

use crate::{
    device::Device,
    error::{Result, TrainErr},
    generator::Generator,
    params::BuildContext,
};

/// One device's copy of the generator computation.
///
/// Owns its index, device handle and scope label only; the parameters stay
/// with the shared set the build context carries.
#[derive(Debug)]
pub struct DeviceReplica {
    index: usize,
    device: Device,
    scope: String,
}

impl DeviceReplica {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Label used for per-replica logs and metrics.
    pub fn scope(&self) -> &str {
        &self.scope
    }
}

/// Builds one replica per configured device.
///
/// Replica 0 creates the shared parameters; every later replica registers
/// with the reuse flag set and must resolve the exact same identities.
/// After replica 0 the trainable generator list is frozen for the rest of
/// the run.
///
/// # Errors
/// `Configuration` on an empty device list; `DeviceUnavailable` as soon as
/// any device fails its availability probe, aborting construction entirely.
pub fn replicate(
    devices: &[Device],
    generator: &mut dyn Generator,
    ctx: &mut BuildContext,
) -> Result<Vec<DeviceReplica>> {
    if devices.is_empty() {
        return Err(TrainErr::Configuration {
            detail: "no devices configured".into(),
        });
    }

    let mut replicas = Vec::with_capacity(devices.len());

    for (index, &device) in devices.iter().enumerate() {
        if !device.is_available() {
            return Err(TrainErr::DeviceUnavailable {
                device: device.to_string(),
            });
        }

        ctx.set_reuse(index > 0);
        generator.register(ctx)?;

        if index == 0 {
            ctx.freeze();
        }

        let scope = format!("device_{index}");
        debug!(replica = index; "built {scope} on {device}");
        replicas.push(DeviceReplica {
            index,
            device,
            scope,
        });
    }

    Ok(replicas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{SkipMode, StackedLstm};

    fn generator() -> StackedLstm {
        StackedLstm::new(4, 3, 2, 2, SkipMode::None, false, 1.0)
    }

    #[test]
    fn parameters_are_created_exactly_once() {
        let mut generator = generator();
        let mut ctx = BuildContext::new(Some(1));

        let replicas = replicate(
            &[Device::Cpu, Device::Cpu, Device::Cpu],
            &mut generator,
            &mut ctx,
        )
        .unwrap();

        assert_eq!(replicas.len(), 3);
        // 2 cells * 3 tensors + output projection * 2.
        assert_eq!(ctx.params().len(), 8);
        assert_eq!(replicas[2].scope(), "device_2");
    }

    #[test]
    fn trainable_list_is_frozen_after_replica_zero() {
        let mut generator = generator();
        let mut ctx = BuildContext::new(Some(1));

        replicate(&[Device::Cpu, Device::Cpu], &mut generator, &mut ctx).unwrap();
        assert!(ctx.frozen().is_some());
        assert_eq!(ctx.frozen().unwrap().len(), 8);
    }

    #[test]
    fn unavailable_device_aborts_construction() {
        let mut generator = generator();
        let mut ctx = BuildContext::new(Some(1));

        let err = replicate(
            &[Device::Cpu, Device::Lane(usize::MAX)],
            &mut generator,
            &mut ctx,
        )
        .unwrap_err();
        assert!(matches!(err, TrainErr::DeviceUnavailable { .. }));
    }

    #[test]
    fn empty_device_list_is_a_configuration_error() {
        let mut generator = generator();
        let mut ctx = BuildContext::new(Some(1));

        let err = replicate(&[], &mut generator, &mut ctx).unwrap_err();
        assert!(matches!(err, TrainErr::Configuration { .. }));
    }
}
