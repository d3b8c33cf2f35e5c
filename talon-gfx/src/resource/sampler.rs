//! Samplers: a thin owned wrapper around `hal::Sampler`, since unlike buffers/textures it needs
//! no bound memory of its own.

use std::mem::ManuallyDrop;

use hal::{device::Device as _, image::SamplerDesc};

use crate::{error::Result, types::*};

pub struct Sampler {
    raw: ManuallyDrop<SamplerT>,
}

impl Sampler {
    pub fn new(device: &DeviceT, desc: &SamplerDesc) -> Result<Self> {
        let raw = unsafe { device.create_sampler(desc)? };
        Ok(Sampler {
            raw: ManuallyDrop::new(raw),
        })
    }

    pub fn raw(&self) -> &SamplerT {
        &self.raw
    }

    pub fn deactivate(mut self, device: &DeviceT) {
        unsafe { device.destroy_sampler(ManuallyDrop::take(&mut self.raw)) };
    }
}
