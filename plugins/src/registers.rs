//! Register snapshot tracking
//!
//! Keeps the last-known value of every register of a vCPU and diffs it
//! against the live value on demand. Each register owns two buffers; a
//! diff reads into the spare one and, when the value changed, flips which
//! buffer is current instead of copying bytes.

use crate::hamming::hamming_weight;
use tcg_plugin_api::{RegisterDescriptor, RegisterHandle, VcpuContext};

/// One tracked register
///
/// Invariant: both slots hold exactly `width` bytes once a diff has run,
/// `slots[current]` is the last-known value and the other slot is scratch.
#[derive(Debug, Clone)]
pub struct RegisterTrack {
    handle: RegisterHandle,
    name: String,
    width: usize,
    slots: [Vec<u8>; 2],
    current: usize,
}

impl RegisterTrack {
    /// Start tracking `desc`, seeding the last-known value with a read
    ///
    /// # Panics
    /// If the register cannot be read, or the read size disagrees with the
    /// declared width.
    pub fn new(desc: &RegisterDescriptor, ctx: &dyn VcpuContext) -> Self {
        let mut initial = Vec::with_capacity(desc.width);
        let read = read_register(ctx, desc.handle, &desc.name, &mut initial);

        assert!(read > 0, "register '{}' initial read returned no bytes", desc.name);
        if desc.width != 0 {
            assert_eq!(
                read, desc.width,
                "register '{}' initial read returned {} bytes, expected {}",
                desc.name, read, desc.width
            );
        }

        Self {
            handle: desc.handle,
            name: desc.name.clone(),
            width: read,
            slots: [initial, Vec::with_capacity(read)],
            current: 0,
        }
    }

    /// Register name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width in bytes
    pub fn width(&self) -> usize {
        self.width
    }

    /// Last-known value
    pub fn previous(&self) -> &[u8] {
        &self.slots[self.current]
    }

    /// Re-read the register and return the leakage of this interval
    ///
    /// An unchanged register leaks nothing and both buffers are left
    /// alone. A changed register leaks the Hamming weight of its new value,
    /// which then becomes the last-known value.
    ///
    /// # Panics
    /// If the read size differs from the tracked width.
    pub fn refresh(&mut self, ctx: &dyn VcpuContext) -> u64 {
        let scratch = self.current ^ 1;
        let read = read_register(ctx, self.handle, &self.name, &mut self.slots[scratch]);
        assert_eq!(
            read, self.width,
            "register '{}' read returned {} bytes, expected {}",
            self.name, read, self.width
        );

        if self.slots[scratch] == self.slots[self.current] {
            return 0;
        }

        let leakage = hamming_weight(&self.slots[scratch]);
        self.current = scratch;
        leakage
    }
}

fn read_register(ctx: &dyn VcpuContext, handle: RegisterHandle, name: &str, buf: &mut Vec<u8>) -> usize {
    match ctx.read_register(handle, buf) {
        Ok(read) => read,
        Err(err) => {
            tracing::error!("Reading register '{}' on vCPU {} failed: {}", name, ctx.vcpu_index(), err);
            panic!("register '{}' is unreadable: {}", name, err);
        }
    }
}

/// All registers of one vCPU, in enumeration order
#[derive(Debug, Clone, Default)]
pub struct RegisterSnapshot {
    tracks: Vec<RegisterTrack>,
}

impl RegisterSnapshot {
    /// Enumerate every register exposed by the runtime and read it once
    pub fn initialize(ctx: &dyn VcpuContext) -> Self {
        let tracks: Vec<RegisterTrack> = ctx
            .registers()
            .iter()
            .map(|desc| RegisterTrack::new(desc, ctx))
            .collect();

        tracing::debug!("Tracking {} registers on vCPU {}", tracks.len(), ctx.vcpu_index());
        Self { tracks }
    }

    /// Total leakage since the previous diff, summed over all registers
    pub fn diff(&mut self, ctx: &dyn VcpuContext) -> u64 {
        self.tracks.iter_mut().map(|track| track.refresh(ctx)).sum()
    }

    /// Tracked registers
    pub fn tracks(&self) -> &[RegisterTrack] {
        &self.tracks
    }

    /// Number of tracked registers
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// True when the vCPU exposes no registers
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tcg_plugin_api::HostError;

    /// Register file driven directly by the test
    pub(crate) struct FakeCpu {
        pub regs: Vec<Vec<u8>>,
        /// Overrides the size of every read when set
        pub read_len: Option<usize>,
    }

    impl FakeCpu {
        pub fn new(regs: Vec<Vec<u8>>) -> Self {
            Self { regs, read_len: None }
        }
    }

    impl VcpuContext for FakeCpu {
        fn vcpu_index(&self) -> u32 {
            0
        }

        fn registers(&self) -> Vec<RegisterDescriptor> {
            self.regs
                .iter()
                .enumerate()
                .map(|(i, value)| RegisterDescriptor {
                    handle: RegisterHandle(i),
                    name: format!("r{}", i),
                    width: value.len(),
                })
                .collect()
        }

        fn read_register(&self, handle: RegisterHandle, buf: &mut Vec<u8>) -> Result<usize, HostError> {
            let value = self.regs.get(handle.0).ok_or(HostError::UnknownRegister(handle.0))?;
            let len = self.read_len.unwrap_or(value.len()).min(value.len());
            buf.clear();
            buf.extend_from_slice(&value[..len]);
            Ok(len)
        }

        fn set_pc(&mut self, _pc: u64) {}

        fn savevm(&mut self, _name: &str) -> Result<(), HostError> {
            Ok(())
        }

        fn outs(&mut self, _msg: &str) {}
    }

    #[test]
    fn test_unchanged_register_leaks_nothing() {
        let cpu = FakeCpu::new(vec![vec![0xaa; 8]]);
        let mut snapshot = RegisterSnapshot::initialize(&cpu);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.diff(&cpu), 0, "Unchanged register should contribute 0");
        assert_eq!(snapshot.diff(&cpu), 0);
    }

    #[test]
    fn test_leakage_is_weight_of_new_value() {
        let mut cpu = FakeCpu::new(vec![vec![0x00]]);
        let mut snapshot = RegisterSnapshot::initialize(&cpu);

        cpu.regs[0] = vec![0xff];
        assert_eq!(snapshot.diff(&cpu), 8, "0x00 -> 0xff should leak 8");

        let mut cpu = FakeCpu::new(vec![vec![0x00]]);
        let mut snapshot = RegisterSnapshot::initialize(&cpu);
        cpu.regs[0] = vec![0x0f];
        assert_eq!(snapshot.diff(&cpu), 4, "0x00 -> 0x0f should leak 4");
    }

    #[test]
    fn test_weight_not_distance() {
        // 0xff -> 0xfe flips one bit but the new value has 7 set bits
        let mut cpu = FakeCpu::new(vec![vec![0xff]]);
        let mut snapshot = RegisterSnapshot::initialize(&cpu);
        cpu.regs[0] = vec![0xfe];
        assert_eq!(snapshot.diff(&cpu), 7);

        // Changing to zero leaks nothing even though bits flipped
        cpu.regs[0] = vec![0x00];
        assert_eq!(snapshot.diff(&cpu), 0);
    }

    #[test]
    fn test_buffers_swap_on_change() {
        let mut cpu = FakeCpu::new(vec![vec![0x01, 0x00]]);
        let mut snapshot = RegisterSnapshot::initialize(&cpu);
        assert_eq!(snapshot.tracks()[0].previous(), &[0x01, 0x00]);

        cpu.regs[0] = vec![0x03, 0x80];
        assert_eq!(snapshot.diff(&cpu), 3);
        assert_eq!(snapshot.tracks()[0].previous(), &[0x03, 0x80], "New value becomes last-known");

        // Same value again: nothing leaks, last-known is kept
        assert_eq!(snapshot.diff(&cpu), 0);
        assert_eq!(snapshot.tracks()[0].previous(), &[0x03, 0x80]);

        // Back to the original value
        cpu.regs[0] = vec![0x01, 0x00];
        assert_eq!(snapshot.diff(&cpu), 1);
        assert_eq!(snapshot.tracks()[0].previous(), &[0x01, 0x00]);
    }

    #[test]
    fn test_sum_over_registers() {
        let mut cpu = FakeCpu::new(vec![vec![0; 4], vec![0; 4], vec![0; 2]]);
        let mut snapshot = RegisterSnapshot::initialize(&cpu);

        cpu.regs[0] = vec![0xff, 0, 0, 0];
        cpu.regs[2] = vec![0x01, 0x01];
        assert_eq!(snapshot.diff(&cpu), 10);
    }

    #[test]
    fn test_no_registers() {
        let cpu = FakeCpu::new(Vec::new());
        let mut snapshot = RegisterSnapshot::initialize(&cpu);
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.diff(&cpu), 0);
    }

    #[test]
    #[should_panic(expected = "expected 4")]
    fn test_read_size_mismatch_is_fatal() {
        let mut cpu = FakeCpu::new(vec![vec![0; 4]]);
        let mut snapshot = RegisterSnapshot::initialize(&cpu);
        cpu.read_len = Some(2);
        snapshot.diff(&cpu);
    }

    #[test]
    #[should_panic(expected = "initial read returned no bytes")]
    fn test_empty_initial_read_is_fatal() {
        let mut cpu = FakeCpu::new(vec![vec![0; 4]]);
        cpu.read_len = Some(0);
        RegisterSnapshot::initialize(&cpu);
    }
}
