//! Configuration surface the core consumes at the pipeline entry point and
//! the platform memory map it allocates against. Both are flat, immutable
//! records built once by the CLI (or, eventually, a config-file loader) —
//! no environment/context object hides mutable state.

use clap::ValueEnum;

/// Target platform. Only `C64` is fully implemented for the MVP; the
/// others are accepted by the config type but rejected with
/// `CONFIG_UNKNOWN_TARGET` at pipeline entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
pub enum Target {
    C64,
    C128,
    X16,
}

/// Optimizer pass set. `O0` disables both the IL and ASM optimizers
/// entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    O3,
    Os,
    Oz,
}

impl OptLevel {
    pub fn optimizer_enabled(self) -> bool {
        !matches!(self, OptLevel::O0)
    }
}

/// Debug-info verbosity: controls inline source-location comments and
/// VICE label-file generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum DebugLevel {
    None,
    Inline,
    Vice,
    Both,
}

impl DebugLevel {
    pub fn wants_inline_comments(self) -> bool {
        matches!(self, DebugLevel::Inline | DebugLevel::Both)
    }

    pub fn wants_vice_labels(self) -> bool {
        matches!(self, DebugLevel::Vice | DebugLevel::Both)
    }
}

/// Which artifacts the pipeline should produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
pub enum OutputFormat {
    Asm,
    Prg,
    Both,
}

impl OutputFormat {
    pub fn wants_asm(self) -> bool {
        matches!(self, OutputFormat::Asm | OutputFormat::Both)
    }

    pub fn wants_prg(self) -> bool {
        matches!(self, OutputFormat::Prg | OutputFormat::Both)
    }
}

/// The configuration record consumed at pipeline entry. The CLI/config-file
/// layer that produces this is out of scope; this crate only defines and
/// consumes the shape.
#[derive(Clone, Debug)]
pub struct CompileConfig {
    pub target: Target,
    pub optimization: OptLevel,
    pub debug: DebugLevel,
    pub output_format: OutputFormat,
    pub load_address: u16,
    pub basic_stub: bool,
    pub strict: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        CompileConfig {
            target: Target::C64,
            optimization: OptLevel::O1,
            debug: DebugLevel::None,
            output_format: OutputFormat::Both,
            load_address: 0x0801,
            basic_stub: true,
            strict: false,
        }
    }
}

/// An inclusive byte-address range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u16,
    pub end: u16,
}

impl AddressRange {
    pub const fn new(start: u16, end: u16) -> Self {
        AddressRange { start, end }
    }

    pub fn contains(self, address: u16) -> bool {
        address >= self.start && address <= self.end
    }

    pub fn len(self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn is_empty(self) -> bool {
        false
    }
}

/// A named hardware I/O range: any address inside one is volatile, and
/// reads/writes to it are warning-worthy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HardwareRange {
    pub name: &'static str,
    pub range: AddressRange,
}

/// Per-target memory map and allocation pools.
#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub target: Target,
    pub zero_page: AddressRange,
    pub zero_page_reserved: Vec<AddressRange>,
    pub zero_page_scratch: AddressRange,
    pub frame_region: AddressRange,
    pub general_ram: AddressRange,
    pub hardware_ranges: Vec<HardwareRange>,
    pub rom_ranges: Vec<AddressRange>,
    /// Cap on the loop-bonus multiplier used by zero-page scoring, left as
    /// a configurable constant rather than a hardcoded one.
    pub zp_loop_bonus_cap: u32,
}

impl PlatformConfig {
    /// Default C64 memory map.
    pub fn c64() -> Self {
        PlatformConfig {
            target: Target::C64,
            zero_page: AddressRange::new(0x02, 0x8F),
            zero_page_reserved: Vec::new(),
            zero_page_scratch: AddressRange::new(0xFB, 0xFE),
            frame_region: AddressRange::new(0x0200, 0x03FF),
            general_ram: AddressRange::new(0x0800, 0x9FFF),
            hardware_ranges: vec![
                HardwareRange {
                    name: "VIC-II",
                    range: AddressRange::new(0xD000, 0xD3FF),
                },
                HardwareRange {
                    name: "SID",
                    range: AddressRange::new(0xD400, 0xD7FF),
                },
                HardwareRange {
                    name: "color RAM",
                    range: AddressRange::new(0xD800, 0xDBFF),
                },
                HardwareRange {
                    name: "CIA1",
                    range: AddressRange::new(0xDC00, 0xDCFF),
                },
                HardwareRange {
                    name: "CIA2",
                    range: AddressRange::new(0xDD00, 0xDDFF),
                },
            ],
            rom_ranges: vec![
                AddressRange::new(0xA000, 0xBFFF),
                AddressRange::new(0xE000, 0xFFFF),
            ],
            zp_loop_bonus_cap: 16,
        }
    }

    pub fn for_target(target: Target) -> Option<Self> {
        match target {
            Target::C64 => Some(Self::c64()),
            Target::C128 | Target::X16 => None,
        }
    }

    pub fn hardware_range_containing(&self, address: u16) -> Option<&HardwareRange> {
        self.hardware_ranges
            .iter()
            .find(|hw| hw.range.contains(address))
    }

    pub fn is_volatile(&self, address: u16) -> bool {
        self.hardware_range_containing(address).is_some()
    }

    pub fn is_rom(&self, address: u16) -> bool {
        self.rom_ranges.iter().any(|r| r.contains(address))
    }

    pub fn zero_page_scratch_bytes(&self) -> u32 {
        self.zero_page_scratch.len()
    }
}

/// Process exit codes the core's callers map onto. The core itself never
/// calls `std::process::exit`; the CLI binary computes this from the
/// pipeline's `Diagnostics`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    CompilationError = 1,
    ConfigurationError = 2,
    AcmeFailed = 4,
    InternalError = 5,
}
