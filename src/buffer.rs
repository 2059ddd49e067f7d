use crate::error::{Error, Result};

/// One entry of the host's buffer request: a direction and a channel index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub is_input: bool,
    pub channel: usize,
}

impl Binding {
    pub fn input(channel: usize) -> Self {
        Self { is_input: true, channel }
    }

    pub fn output(channel: usize) -> Self {
        Self { is_input: false, channel }
    }
}

/// The host-side double buffer: one planar `i32` plane per bound channel and
/// half. The host reads input planes and fills output planes from inside the
/// switch callback; the stream thread owns the set for the run's lifetime.
#[derive(Debug)]
pub struct HostBuffers {
    bindings: Vec<Binding>,
    frames: usize,
    planes: Vec<[Vec<i32>; 2]>,
}

impl HostBuffers {
    pub(crate) fn new(bindings: &[Binding], frames: usize) -> Self {
        let planes =
            bindings.iter().map(|_| [vec![0; frames], vec![0; frames]]).collect();
        Self { bindings: bindings.to_vec(), frames, planes }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn is_channel_active(&self, is_input: bool, channel: usize) -> bool {
        self.bindings.iter().any(|b| b.is_input == is_input && b.channel == channel)
    }

    pub(crate) fn plane(&self, binding: usize, half: usize) -> &[i32] {
        &self.planes[binding][half]
    }

    pub(crate) fn plane_mut(&mut self, binding: usize, half: usize) -> &mut [i32] {
        &mut self.planes[binding][half]
    }

    pub(crate) fn planes_mut(
        &mut self,
        half: usize,
    ) -> impl Iterator<Item = (Binding, &mut [i32])> {
        self.bindings
            .iter()
            .copied()
            .zip(self.planes.iter_mut().map(move |halves| &mut halves[half][..]))
    }

    fn index_of(&self, is_input: bool, channel: usize) -> Result<usize> {
        self.bindings
            .iter()
            .position(|b| b.is_input == is_input && b.channel == channel)
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "{} channel {} is not bound",
                    if is_input { "input" } else { "output" },
                    channel
                ))
            })
    }

    /// Input plane for the host to read during a switch callback.
    pub fn input_plane(&self, channel: usize, half: usize) -> Result<&[i32]> {
        Ok(self.plane(self.index_of(true, channel)?, half))
    }

    /// Output plane for the host to fill during a switch callback.
    pub fn output_plane_mut(&mut self, channel: usize, half: usize) -> Result<&mut [i32]> {
        let index = self.index_of(false, channel)?;
        Ok(self.plane_mut(index, half))
    }
}
