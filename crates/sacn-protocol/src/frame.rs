//! Pre-serialized transmit buffers.
//!
//! A source sends the same universe up to 44 times a second, so the
//! datagram is packed once and the handful of bytes that change between
//! sends (sequence, options, priority, slot values) are patched in place
//! at their fixed offsets. Flags-and-length fields never change after
//! construction because a levels or priority frame always carries all
//! 512 slots.

use uuid::Uuid;

use crate::layout;
use crate::packet::StartCode;
use crate::priority::Priority;
use crate::source_name::SourceName;
use crate::universe::Universe;
use crate::UNIVERSE_SIZE;

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn write_root_layer(buf: &mut [u8], cid: Uuid, vector: u32) {
    let total = buf.len();
    write_u16(buf, 0, layout::PREAMBLE_SIZE);
    write_u16(buf, 2, layout::POSTAMBLE_SIZE);
    buf[layout::ACN_IDENTIFIER_RANGE].copy_from_slice(layout::ACN_IDENTIFIER);
    write_u16(
        buf,
        layout::ROOT_FLAGS_LENGTH_RANGE.start,
        layout::flags_and_length(total, layout::ROOT_FLAGS_LENGTH_RANGE.start),
    );
    write_u32(buf, layout::ROOT_VECTOR_RANGE.start, vector);
    buf[layout::CID_RANGE].copy_from_slice(cid.as_bytes());
}

/// One universe's data datagram, either the levels stream or the 0xDD
/// per-address-priority stream, held fully packed between ticks.
#[derive(Debug, Clone)]
pub struct DataFrame {
    buf: Vec<u8>,
}

impl DataFrame {
    pub const LEN: usize = layout::DMX_DATA_OFFSET + UNIVERSE_SIZE;

    pub fn new(
        cid: Uuid,
        source_name: &SourceName,
        priority: Priority,
        universe: Universe,
        start_code: StartCode,
        values: &[u8; UNIVERSE_SIZE],
    ) -> Self {
        let mut buf = vec![0u8; Self::LEN];
        write_root_layer(&mut buf, cid, layout::VECTOR_ROOT_DATA);

        write_u16(
            &mut buf,
            layout::FRAMING_FLAGS_LENGTH_RANGE.start,
            layout::flags_and_length(Self::LEN, layout::FRAMING_FLAGS_LENGTH_RANGE.start),
        );
        write_u32(
            &mut buf,
            layout::FRAMING_VECTOR_RANGE.start,
            layout::VECTOR_FRAMING_DATA,
        );
        source_name.pack_into(&mut buf[layout::SOURCE_NAME_RANGE]);
        buf[layout::PRIORITY_OFFSET] = priority.get();
        // Sync address stays zero: this source never requests universe sync.
        write_u16(&mut buf, layout::UNIVERSE_RANGE.start, universe.get());

        write_u16(
            &mut buf,
            layout::DMP_FLAGS_LENGTH_RANGE.start,
            layout::flags_and_length(Self::LEN, layout::DMP_FLAGS_LENGTH_RANGE.start),
        );
        buf[layout::DMP_VECTOR_OFFSET] = layout::VECTOR_DMP_SET_PROPERTY;
        buf[layout::DMP_ADDRESS_TYPE_OFFSET] = layout::DMP_ADDRESS_TYPE;
        write_u16(
            &mut buf,
            layout::DMP_FIRST_ADDRESS_RANGE.start,
            layout::DMP_FIRST_ADDRESS,
        );
        write_u16(
            &mut buf,
            layout::DMP_ADDRESS_INCREMENT_RANGE.start,
            layout::DMP_ADDRESS_INCREMENT,
        );
        write_u16(
            &mut buf,
            layout::DMP_PROPERTY_COUNT_RANGE.start,
            (UNIVERSE_SIZE + 1) as u16,
        );
        buf[layout::START_CODE_OFFSET] = start_code as u8;
        buf[layout::DMX_DATA_OFFSET..].copy_from_slice(values);

        DataFrame { buf }
    }

    pub fn sequence(&self) -> u8 {
        self.buf[layout::SEQUENCE_OFFSET]
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.buf[layout::SEQUENCE_OFFSET] = sequence;
    }

    pub fn set_preview(&mut self, preview: bool) {
        self.set_option(layout::OPTION_PREVIEW, preview);
    }

    pub fn set_terminated(&mut self, terminated: bool) {
        self.set_option(layout::OPTION_TERMINATED, terminated);
    }

    fn set_option(&mut self, mask: u8, on: bool) {
        if on {
            self.buf[layout::OPTIONS_OFFSET] |= mask;
        } else {
            self.buf[layout::OPTIONS_OFFSET] &= !mask;
        }
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.buf[layout::PRIORITY_OFFSET] = priority.get();
    }

    pub fn set_source_name(&mut self, source_name: &SourceName) {
        source_name.pack_into(&mut self.buf[layout::SOURCE_NAME_RANGE]);
    }

    pub fn set_values(&mut self, values: &[u8; UNIVERSE_SIZE]) {
        self.buf[layout::DMX_DATA_OFFSET..].copy_from_slice(values);
    }

    pub fn set_slot(&mut self, slot: usize, value: u8) {
        debug_assert!(slot < UNIVERSE_SIZE);
        self.buf[layout::DMX_DATA_OFFSET + slot] = value;
    }

    pub fn values(&self) -> &[u8] {
        &self.buf[layout::DMX_DATA_OFFSET..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// One page of a universe-discovery datagram. Discovery fires every ten
/// seconds, so pages are rebuilt per transmission instead of patched.
#[derive(Debug, Clone)]
pub struct DiscoveryFrame {
    buf: Vec<u8>,
}

impl DiscoveryFrame {
    pub fn new(
        cid: Uuid,
        source_name: &SourceName,
        page: u8,
        last_page: u8,
        universes: &[Universe],
    ) -> Self {
        debug_assert!(universes.len() <= layout::DISCOVERY_UNIVERSES_PER_PAGE);
        debug_assert!(page <= last_page);

        let total = layout::DISCOVERY_LIST_OFFSET + universes.len() * 2;
        let mut buf = vec![0u8; total];
        write_root_layer(&mut buf, cid, layout::VECTOR_ROOT_EXTENDED);

        write_u16(
            &mut buf,
            layout::FRAMING_FLAGS_LENGTH_RANGE.start,
            layout::flags_and_length(total, layout::FRAMING_FLAGS_LENGTH_RANGE.start),
        );
        write_u32(
            &mut buf,
            layout::FRAMING_VECTOR_RANGE.start,
            layout::VECTOR_EXTENDED_DISCOVERY,
        );
        source_name.pack_into(&mut buf[layout::SOURCE_NAME_RANGE]);
        // 108..112 is the reserved block, transmitted as zeros.

        write_u16(
            &mut buf,
            layout::DISCOVERY_FLAGS_LENGTH_RANGE.start,
            layout::flags_and_length(total, layout::DISCOVERY_FLAGS_LENGTH_RANGE.start),
        );
        write_u32(
            &mut buf,
            layout::DISCOVERY_VECTOR_RANGE.start,
            layout::VECTOR_DISCOVERY_UNIVERSE_LIST,
        );
        buf[layout::DISCOVERY_PAGE_OFFSET] = page;
        buf[layout::DISCOVERY_LAST_PAGE_OFFSET] = last_page;
        for (i, universe) in universes.iter().enumerate() {
            write_u16(
                &mut buf,
                layout::DISCOVERY_LIST_OFFSET + i * 2,
                universe.get(),
            );
        }

        DiscoveryFrame { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}
