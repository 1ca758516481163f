use crate::{CompressedWriteStream, Dependency, Relocation};

/// Encodes relocation records in code order.
#[derive(Clone, Debug, Default)]
pub struct RelocationRecorder {
    stream: CompressedWriteStream,
    last_offset: u32,
    count: usize,
}

impl RelocationRecorder {
    /// Appends `reloc`; records must arrive in non-decreasing offset order.
    pub fn push(&mut self, reloc: Relocation) {
        let offset = reloc.offset();
        assert!(
            offset >= self.last_offset,
            "relocation at {offset} recorded after one at {}",
            self.last_offset
        );
        reloc.write_on(&mut self.stream, offset - self.last_offset);
        self.last_offset = offset;
        self.count += 1;
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The encoded records.
    pub fn finish(self) -> Vec<u8> {
        self.stream.into_bytes()
    }
}

/// Collects the assumptions a method is compiled under, dropping
/// duplicates.
#[derive(Clone, Debug, Default)]
pub struct DependencyRecorder {
    deps: Vec<Dependency>,
}

impl DependencyRecorder {
    /// Records `dep` unless it was already recorded.
    pub fn assert_dependency(&mut self, dep: Dependency) {
        if !self.deps.contains(&dep) {
            self.deps.push(dep);
        }
    }

    /// The encoded dependencies.
    pub fn finish(self) -> Vec<u8> {
        let mut stream = CompressedWriteStream::new();
        for dep in &self.deps {
            dep.write_on(&mut stream);
        }
        stream.into_bytes()
    }
}
