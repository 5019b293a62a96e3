//! File-level properties of the codec and the packet readers.

use std::fs;

use tof_gaps::events::{MasterTriggerEvent, RBEvent, RBEventHeader, TofEvent};
use tof_gaps::io::TofPacketReader;
use tof_gaps::packets::{get_tofpackets, Packable, PacketType, Scanner, TofPacket};
use tof_gaps::waveform::Waveform;
use tof_gaps::NWORDS;

fn example_event(event_id: u32) -> TofEvent {
    let mut header = RBEventHeader::new();
    header.rb_id = 4;
    header.event_id = event_id;
    header.channel_mask = 0b1;
    header.stop_cell = 512;
    let mut rb_event = RBEvent::new(header);
    let adc: Vec<u16> = (0..NWORDS).map(|i| (i as u16) & 0x3FFF).collect();
    rb_event.waveforms.push(Waveform::new(4, 0, 512, adc));
    let mut event = TofEvent::new(MasterTriggerEvent::new(event_id));
    event.rb_events.push(rb_event);
    event
}

#[test]
fn packets_roundtrip_through_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.tof.gaps");

    let packets = vec![
        example_event(1).pack(),
        TofPacket::new(PacketType::RBMoniData, vec![0xAB; 40]),
        example_event(2).pack(),
        TofPacket::new(PacketType::Other(200), vec![1, 2, 3]),
    ];
    let mut stream = Vec::new();
    for packet in &packets {
        stream.extend(packet.to_bytestream());
    }
    fs::write(&path, &stream).unwrap();

    let read_back: Vec<TofPacket> = TofPacketReader::from_file(&path).collect();
    assert_eq!(read_back, packets);

    // and the typed payloads survive
    let event = TofEvent::from_tofpacket(&read_back[0]).unwrap();
    assert_eq!(event, example_event(1));
}

#[test]
fn scanner_multiset_matches_partition() {
    // A byte sequence interleaving valid packets with malformed regions:
    // the scanner must recover exactly the valid packets, as a multiset
    // of (tag, payload).
    let packets = vec![
        TofPacket::new(PacketType::TofEvent, vec![1; 30]),
        TofPacket::new(PacketType::TofEvent, vec![1; 30]), // duplicate on purpose
        TofPacket::new(PacketType::MtbMoniData, vec![2; 5]),
        TofPacket::new(PacketType::Other(77), vec![]),
    ];
    let mut stream = vec![0x55, 0xAA, 0x00]; // noise prefix
    for packet in &packets {
        stream.extend(packet.to_bytestream());
        stream.extend_from_slice(&[0xAA, 0xAA, 0x03]); // truncated fake header
    }

    let offsets: Vec<(usize, usize, PacketType)> = Scanner::new(&stream).collect();
    assert_eq!(offsets.len(), packets.len());

    let mut recovered = Vec::new();
    for (offset, _, _) in offsets {
        let mut pos = offset;
        recovered.push(TofPacket::from_bytestream(&stream, &mut pos).unwrap());
    }
    let key = |p: &TofPacket| (p.packet_type.to_u8(), p.payload.clone());
    let mut expected: Vec<_> = packets.iter().map(key).collect();
    let mut found: Vec<_> = recovered.iter().map(key).collect();
    expected.sort();
    found.sort();
    assert_eq!(found, expected);

    assert_eq!(get_tofpackets(&stream), recovered);
}

#[test]
fn reader_is_restartable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rewind.tof.gaps");
    let mut stream = Vec::new();
    for event_id in 0..5u32 {
        stream.extend(example_event(event_id).pack().to_bytestream());
    }
    fs::write(&path, stream).unwrap();

    let mut reader = TofPacketReader::from_file(&path);
    assert_eq!(reader.by_ref().count(), 5);
    assert_eq!(reader.by_ref().count(), 0, "reader is exhausted");
    reader.rewind();
    assert_eq!(reader.by_ref().count(), 5, "rewind restarts from byte 0");
}

#[test]
fn index_sidecar_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("indexed.tof.gaps");
    let mut stream = Vec::new();
    for event_id in 0..3u32 {
        stream.extend(example_event(event_id).pack().to_bytestream());
    }
    stream.extend(TofPacket::new(PacketType::CPUMoniData, vec![7; 12]).to_bytestream());
    fs::write(&path, stream).unwrap();

    let counts = {
        let mut reader = TofPacketReader::from_file(&path);
        reader.index().counts.clone()
    };
    let sidecar = dir.path().join("indexed.tof.gaps.idx");
    assert!(sidecar.exists(), "index is cached next to the file");

    // a second reader must come up with the same counts from the cache
    let mut reader = TofPacketReader::from_file(&path);
    assert_eq!(reader.index().counts, counts);
    assert_eq!(counts[&PacketType::TofEvent.to_u8()], 3);
    assert_eq!(counts[&PacketType::CPUMoniData.to_u8()], 1);

    // first/last are O(1) accessors once indexed
    let first = reader.first().unwrap();
    let last = reader.last().unwrap();
    assert_eq!(TofEvent::peek_event_id(&first).unwrap(), 0);
    assert_eq!(last.packet_type, PacketType::CPUMoniData);
}
