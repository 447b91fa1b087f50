//! Decoding of E1.31 datagrams.
//!
//! The wire format is a stack of length-prefixed PDUs: Root, then either
//! Data-Framing + DMP or Universe-Discovery-Framing + Universe-Discovery.
//! Every layer is validated against the constants in [`crate::layout`];
//! anything that deviates produces a typed [`ParseError`] and the caller
//! drops the datagram.
//!
//! Packing for the transmit path lives in [`crate::frame`], which keeps
//! one pre-serialized buffer per universe and mutates it in place.

use uuid::Uuid;

use crate::error::ParseError;
use crate::layout;
use crate::priority::Priority;
use crate::source_name::SourceName;
use crate::universe::Universe;

// -- Start codes --

/// First byte of the DMX payload, selecting which stream a data packet
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StartCode {
    /// Plain dimmer levels.
    Levels = 0x00,
    /// Per-address priorities (ETC-style 0xDD stream).
    PerAddressPriority = 0xdd,
}

impl StartCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Levels),
            0xdd => Some(Self::PerAddressPriority),
            _ => None,
        }
    }
}

// -- Parsed packet variants --

/// A decoded data packet: one DMX frame (levels or per-address priority)
/// for one universe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub cid: Uuid,
    pub source_name: SourceName,
    pub priority: Priority,
    pub sequence: u8,
    pub preview: bool,
    pub terminated: bool,
    pub force_sync: bool,
    pub universe: Universe,
    pub start_code: StartCode,
    /// Slot values, start code excluded. At most 512.
    pub values: Vec<u8>,
}

/// A decoded universe-discovery packet: one page of a source's sorted
/// universe list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub cid: Uuid,
    pub source_name: SourceName,
    pub page: u8,
    pub last_page: u8,
    pub universes: Vec<Universe>,
}

/// Any valid sACN datagram this library understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(DataPacket),
    Discovery(DiscoveryPacket),
}

impl Packet {
    /// Decode a datagram. Strict: every fixed field, vector, flag nibble
    /// and length field must be consistent.
    pub fn parse(buf: &[u8]) -> Result<Packet, ParseError> {
        require_len(buf, layout::CID_RANGE.end)?;

        if read_u16(buf, layout::PREAMBLE_RANGE.start) != layout::PREAMBLE_SIZE {
            return Err(ParseError::InvalidPreamble);
        }
        if read_u16(buf, layout::POSTAMBLE_RANGE.start) != layout::POSTAMBLE_SIZE {
            return Err(ParseError::InvalidPostamble);
        }
        if &buf[layout::ACN_IDENTIFIER_RANGE] != layout::ACN_IDENTIFIER {
            return Err(ParseError::InvalidAcnIdentifier);
        }

        check_pdu(buf, layout::ROOT_FLAGS_LENGTH_RANGE.start)?;

        let cid = Uuid::from_slice(&buf[layout::CID_RANGE]).expect("CID range is 16 bytes");

        match read_u32(buf, layout::ROOT_VECTOR_RANGE.start) {
            layout::VECTOR_ROOT_DATA => parse_data(buf, cid).map(Packet::Data),
            layout::VECTOR_ROOT_EXTENDED => parse_discovery(buf, cid).map(Packet::Discovery),
            vector => Err(ParseError::UnknownRootVector { vector }),
        }
    }
}

fn parse_data(buf: &[u8], cid: Uuid) -> Result<DataPacket, ParseError> {
    require_len(buf, layout::DATA_MIN_LEN)?;
    check_pdu(buf, layout::FRAMING_FLAGS_LENGTH_RANGE.start)?;

    let vector = read_u32(buf, layout::FRAMING_VECTOR_RANGE.start);
    if vector != layout::VECTOR_FRAMING_DATA {
        return Err(ParseError::UnknownFramingVector { vector });
    }

    let source_name = SourceName::parse(&buf[layout::SOURCE_NAME_RANGE])?;
    let priority = Priority::new(buf[layout::PRIORITY_OFFSET])?;
    // Sync address (109..111) is read past: universe sync is out of scope.
    let sequence = buf[layout::SEQUENCE_OFFSET];
    let options = buf[layout::OPTIONS_OFFSET];
    let universe = Universe::new(read_u16(buf, layout::UNIVERSE_RANGE.start))?;

    check_pdu(buf, layout::DMP_FLAGS_LENGTH_RANGE.start)?;
    let vector = buf[layout::DMP_VECTOR_OFFSET];
    if vector != layout::VECTOR_DMP_SET_PROPERTY {
        return Err(ParseError::UnknownDmpVector { vector });
    }
    if buf[layout::DMP_ADDRESS_TYPE_OFFSET] != layout::DMP_ADDRESS_TYPE
        || read_u16(buf, layout::DMP_FIRST_ADDRESS_RANGE.start) != layout::DMP_FIRST_ADDRESS
        || read_u16(buf, layout::DMP_ADDRESS_INCREMENT_RANGE.start) != layout::DMP_ADDRESS_INCREMENT
    {
        return Err(ParseError::InvalidAddressType);
    }

    // Count includes the start code, so the payload is count - 1 bytes.
    let count = read_u16(buf, layout::DMP_PROPERTY_COUNT_RANGE.start);
    if count == 0 || count > 513 || buf.len() != layout::DMX_DATA_OFFSET + count as usize - 1 {
        return Err(ParseError::InvalidPropertyValueCount { count });
    }

    let start_code = StartCode::from_u8(buf[layout::START_CODE_OFFSET])
        .ok_or(ParseError::UnknownStartCode { value: buf[layout::START_CODE_OFFSET] })?;

    Ok(DataPacket {
        cid,
        source_name,
        priority,
        sequence,
        preview: options & layout::OPTION_PREVIEW != 0,
        terminated: options & layout::OPTION_TERMINATED != 0,
        force_sync: options & layout::OPTION_FORCE_SYNC != 0,
        universe,
        start_code,
        values: buf[layout::DMX_DATA_OFFSET..].to_vec(),
    })
}

fn parse_discovery(buf: &[u8], cid: Uuid) -> Result<DiscoveryPacket, ParseError> {
    require_len(buf, layout::FRAMING_VECTOR_RANGE.end)?;
    check_pdu(buf, layout::FRAMING_FLAGS_LENGTH_RANGE.start)?;

    // The extended-sync vector (0x1) lands here too; sync framing is not
    // implemented, so it falls out as an unknown framing vector. Checked
    // before the length so a (shorter) sync packet reports its vector.
    let vector = read_u32(buf, layout::FRAMING_VECTOR_RANGE.start);
    if vector != layout::VECTOR_EXTENDED_DISCOVERY {
        return Err(ParseError::UnknownFramingVector { vector });
    }

    require_len(buf, layout::DISCOVERY_MIN_LEN)?;
    let source_name = SourceName::parse(&buf[layout::SOURCE_NAME_RANGE])?;

    check_pdu(buf, layout::DISCOVERY_FLAGS_LENGTH_RANGE.start)?;
    let vector = read_u32(buf, layout::DISCOVERY_VECTOR_RANGE.start);
    if vector != layout::VECTOR_DISCOVERY_UNIVERSE_LIST {
        return Err(ParseError::UnknownDiscoveryVector { vector });
    }

    let page = buf[layout::DISCOVERY_PAGE_OFFSET];
    let last_page = buf[layout::DISCOVERY_LAST_PAGE_OFFSET];
    if page > last_page {
        return Err(ParseError::InvalidPage { page, last_page });
    }

    let list = &buf[layout::DISCOVERY_LIST_OFFSET..];
    if list.len() % 2 != 0 || list.len() / 2 > layout::DISCOVERY_UNIVERSES_PER_PAGE {
        return Err(ParseError::InvalidPduLength { length: buf.len() });
    }

    let universes = list
        .chunks_exact(2)
        .map(|pair| Universe::new(u16::from_be_bytes([pair[0], pair[1]])))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DiscoveryPacket {
        cid,
        source_name,
        page,
        last_page,
        universes,
    })
}

// -- Field readers --

fn require_len(buf: &[u8], needed: usize) -> Result<(), ParseError> {
    if buf.len() < needed {
        return Err(ParseError::TooShort {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Validate one flags-and-length field: 0x7 in the top nibble and a
/// length that reaches exactly the end of the datagram.
fn check_pdu(buf: &[u8], offset: usize) -> Result<(), ParseError> {
    let flags = buf[offset] & 0xf0;
    if flags != layout::PDU_FLAGS {
        return Err(ParseError::InvalidPduFlags { flags });
    }
    let length = (read_u16(buf, offset) & 0x0fff) as usize;
    if offset + length != buf.len() {
        return Err(ParseError::InvalidPduLength { length });
    }
    Ok(())
}
