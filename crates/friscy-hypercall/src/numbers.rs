use core::ops::Range;

/// Identifier a guest places in `a7` when issuing an `ecall`.
///
/// Native RISC-V Linux syscall numbers stay far below the hypercall bands, so a single register
/// carries both and the bands decide which side handles the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HypercallId(pub u64);

impl HypercallId {
    pub const OPEN: HypercallId = HypercallId(600);
    pub const WRITE: HypercallId = HypercallId(601);
    pub const READ: HypercallId = HypercallId(602);
    pub const CLOSE: HypercallId = HypercallId(603);
    pub const PREAD: HypercallId = HypercallId(604);

    pub const MAGIC: HypercallId = HypercallId(700);
    pub const MEMMOVE: HypercallId = HypercallId(703);
    pub const GETTIMEOFDAY: HypercallId = HypercallId(704);
    pub const GETRANDOM: HypercallId = HypercallId(705);
    pub const CONVERT_ENCODING: HypercallId = HypercallId(706);
    /// Structured-data side channel; the guest shim routes writes to [`crate::JSON_CHANNEL_FD`]
    /// here.
    pub const VALIDATE_JSON: HypercallId = HypercallId(708);

    pub const NET_CONNECT: HypercallId = HypercallId(800);
    pub const NET_RESOLVE: HypercallId = HypercallId(801);
    pub const NET_WRITE: HypercallId = HypercallId(802);
    pub const NET_READ: HypercallId = HypercallId(803);

    pub fn band(self) -> Option<Band> {
        Band::of(self.0)
    }

    pub fn name(self) -> Option<&'static str> {
        match self {
            HypercallId::OPEN => Some("OPEN"),
            HypercallId::WRITE => Some("WRITE"),
            HypercallId::READ => Some("READ"),
            HypercallId::CLOSE => Some("CLOSE"),
            HypercallId::PREAD => Some("PREAD"),
            HypercallId::MAGIC => Some("MAGIC"),
            HypercallId::MEMMOVE => Some("MEMMOVE"),
            HypercallId::GETTIMEOFDAY => Some("GETTIMEOFDAY"),
            HypercallId::GETRANDOM => Some("GETRANDOM"),
            HypercallId::CONVERT_ENCODING => Some("CONVERT_ENCODING"),
            HypercallId::VALIDATE_JSON => Some("VALIDATE_JSON"),
            HypercallId::NET_CONNECT => Some("NET_CONNECT"),
            HypercallId::NET_RESOLVE => Some("NET_RESOLVE"),
            HypercallId::NET_WRITE => Some("NET_WRITE"),
            HypercallId::NET_READ => Some("NET_READ"),
            _ => None,
        }
    }
}

impl core::fmt::Display for HypercallId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(name) = self.name() {
            write!(f, "{name}({})", self.0)
        } else {
            write!(f, "HypercallId({})", self.0)
        }
    }
}

/// Fixed group of hypercall identifiers sharing one behavioral contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Band {
    /// Guest-buffer file operations. Each handler may be synchronous or suspending.
    Storage,
    /// Utility calls. Never suspend.
    Compute,
    /// Socket operations. Always suspend.
    Network,
}

impl Band {
    pub const ALL: [Band; 3] = [Band::Storage, Band::Compute, Band::Network];

    pub const fn range(self) -> Range<u64> {
        match self {
            Band::Storage => 600..700,
            Band::Compute => 700..800,
            Band::Network => 800..900,
        }
    }

    pub fn of(number: u64) -> Option<Band> {
        Band::ALL
            .into_iter()
            .find(|band| band.range().contains(&number))
    }
}
