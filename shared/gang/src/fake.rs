use crate::{Device, Gang, GangError, ReduceOp};

/// A gang of one. Every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeGang {
    device: Device,
}

impl FakeGang {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl Gang for FakeGang {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn device(&self) -> Device {
        self.device
    }

    fn all_reduce(&self, _values: &mut [f64], _op: ReduceOp) -> Result<(), GangError> {
        Ok(())
    }

    fn all_gather(&self, value: f64) -> Result<Vec<f64>, GangError> {
        Ok(vec![value])
    }

    fn broadcast(&self, _values: &mut Vec<f64>, source_rank: usize) -> Result<(), GangError> {
        if source_rank != 0 {
            return Err(GangError::InvalidRank {
                rank: source_rank,
                size: 1,
            });
        }
        Ok(())
    }

    fn barrier(&self) -> Result<(), GangError> {
        Ok(())
    }
}
