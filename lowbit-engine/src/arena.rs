#[cfg(test)]
#[path = "../tests/unit/arena_test.rs"]
mod arena_test;

use anyhow::Result;

/// Named sub-regions of the arena.
///
/// Decoder layers alternate between the two scratch regions; tensors that must
/// outlive every layer (final norm, logits) live in the no-bound region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Scratch0,
    Scratch1,
    NoBound,
}

impl Region {
    pub const ALL: [Region; 3] = [Region::Scratch0, Region::Scratch1, Region::NoBound];

    /// Scratch region recycled by decoder layer `layer`.
    pub fn for_layer(layer: usize) -> Self {
        if layer % 2 == 0 { Region::Scratch0 } else { Region::Scratch1 }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Region::Scratch0 => 0,
            Region::Scratch1 => 1,
            Region::NoBound => 2,
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Region::Scratch0 => "scratch0",
            Region::Scratch1 => "scratch1",
            Region::NoBound => "no-bound",
        };
        f.write_str(name)
    }
}

/// A range of f32 slots planned in one region.
///
/// `epoch` counts how many times the region had been recycled when the span was
/// handed out; a span whose epoch is behind its region may have been overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub region: Region,
    pub offset: usize,
    pub len: usize,
    pub epoch: u32,
}

impl Span {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.region == other.region && self.offset < other.end() && other.offset < self.end()
    }
}

#[derive(Debug, Default)]
struct RegionState {
    buffer: Vec<f32>,
    cursor: usize,
    high_water: usize,
    epoch: u32,
}

/// Bump allocator for the tensors of one forward pass.
///
/// Spans are planned while the graph is built, then [`Arena::commit`] grows each
/// region to its high-water mark before anything executes. Buffers are kept across
/// calls, so steady-state decoding does not allocate.
#[derive(Debug, Default)]
pub struct Arena {
    regions: [RegionState; 3],
    /// Upper bound in f32 slots per region, if configured.
    limit: Option<usize>,
}

impl Arena {
    pub fn new(limit: Option<usize>) -> Self {
        Self { limit, ..Self::default() }
    }

    fn state(&self, region: Region) -> &RegionState {
        &self.regions[region.index()]
    }

    fn state_mut(&mut self, region: Region) -> &mut RegionState {
        &mut self.regions[region.index()]
    }

    /// Plans `len` f32 slots in `region`.
    pub fn alloc(&mut self, region: Region, len: usize) -> Result<Span> {
        let limit = self.limit;
        let state = self.state_mut(region);
        let offset = state.cursor;
        let end = offset + len;

        if let Some(limit) = limit {
            if end > limit {
                anyhow::bail!("Arena region {region} exhausted: need {end} slots, limit is {limit}");
            }
        }

        state.cursor = end;
        state.high_water = state.high_water.max(end);
        Ok(Span { region, offset, len, epoch: state.epoch })
    }

    /// Rewinds `region` so the next layer reuses its memory; older spans become stale.
    pub fn recycle(&mut self, region: Region) {
        let state = self.state_mut(region);
        state.cursor = 0;
        state.epoch += 1;
    }

    pub fn epoch(&self, region: Region) -> u32 {
        self.state(region).epoch
    }

    /// True when no recycle of the span's region happened after it was planned.
    pub fn is_live(&self, span: &Span) -> bool {
        self.state(span.region).epoch == span.epoch
    }

    /// Grows every region buffer to its high-water mark.
    pub fn commit(&mut self) {
        for state in self.regions.iter_mut() {
            if state.buffer.len() < state.high_water {
                state.buffer.resize(state.high_water, 0.0);
            }
        }
    }

    /// Rewinds all cursors and epochs for the next graph build. Buffers are kept.
    pub fn reset(&mut self) {
        for state in self.regions.iter_mut() {
            state.cursor = 0;
            state.epoch = 0;
        }
    }

    pub fn high_water(&self, region: Region) -> usize {
        self.state(region).high_water
    }

    /// Committed size of all regions in bytes.
    pub fn size_bytes(&self) -> usize {
        self.regions.iter().map(|s| s.buffer.len() * std::mem::size_of::<f32>()).sum()
    }

    /// Planned size of all regions in bytes.
    pub fn planned_bytes(&self) -> usize {
        self.regions.iter().map(|s| s.high_water * std::mem::size_of::<f32>()).sum()
    }

    pub fn slice(&self, span: &Span) -> &[f32] {
        &self.state(span.region).buffer[span.offset..span.end()]
    }

    pub fn slice_mut(&mut self, span: &Span) -> &mut [f32] {
        &mut self.state_mut(span.region).buffer[span.offset..span.end()]
    }

    /// Borrows several input spans and one output span at once.
    ///
    /// Inputs may overlap each other but none may overlap the output.
    pub fn split_io(&mut self, inputs: &[Span], output: &Span) -> Result<(Vec<&[f32]>, &mut [f32])> {
        for span in inputs.iter().chain(std::iter::once(output)) {
            let available = self.state(span.region).buffer.len();
            if span.end() > available {
                anyhow::bail!("Span {span:?} is outside the committed {} region ({available} slots)", span.region);
            }
        }
        if let Some(span) = inputs.iter().find(|s| s.overlaps(output)) {
            anyhow::bail!("Input span {span:?} overlaps output span {output:?}");
        }

        let bases = self.regions.each_mut().map(|s| s.buffer.as_mut_ptr());

        // SAFETY: every span lies inside its committed buffer (checked above), the
        // output does not overlap any input, and the returned borrows are tied to
        // `&mut self`, so no other access to the buffers can happen while they live.
        let reads = inputs
            .iter()
            .map(|s| unsafe { std::slice::from_raw_parts(bases[s.region.index()].add(s.offset).cast_const(), s.len) })
            .collect();
        let write = unsafe { std::slice::from_raw_parts_mut(bases[output.region.index()].add(output.offset), output.len) };

        Ok((reads, write))
    }
}
