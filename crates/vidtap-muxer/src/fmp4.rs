//! Built-in fragmented-MP4 container backend
//!
//! Writes an `ftyp`+`moov` header up front and one `moof`+`mdat` fragment per
//! packet, so the file is playable from the first fragment and needs no
//! finalization pass. Video tracks are `avc1` (the extradata is a ready-made
//! avcC record), audio tracks are `mp4a` with an AudioSpecificConfig.

use crate::error::{MuxerError, MuxerResult};
use crate::packet::PacketEnvelope;
use crate::writer::{CodecKind, ContainerWriter, Rational, StreamParams};
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

const MOVIE_TIMESCALE: u32 = 1000;
const VIDEO_TIMESCALE: u32 = 90_000;

const SAMPLE_FLAG_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAG_NON_SYNC: u32 = 0x0101_0000;

struct Track {
    kind: CodecKind,
    extradata: Vec<u8>,
    timescale: u32,
    /// End of the last written packet, in track time-base ticks
    pts: i64,
}

/// Fragmented-MP4 [`ContainerWriter`]
pub struct Fmp4Writer {
    file: BufWriter<File>,
    tracks: Vec<Track>,
    header_written: bool,
    sequence_number: u32,
    written: u64,
}

impl Fmp4Writer {
    /// Open `path` for writing; the file is created empty
    pub fn create(path: impl AsRef<Path>) -> MuxerResult<Self> {
        let file = File::create(path.as_ref()).map_err(MuxerError::Open)?;
        debug!("fMP4 output opened at {:?}", path.as_ref());
        Ok(Self {
            file: BufWriter::new(file),
            tracks: Vec::new(),
            header_written: false,
            sequence_number: 1,
            written: 0,
        })
    }

    fn put(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn write_box(buf: &mut BytesMut, box_type: &[u8; 4], content: &[u8]) {
        buf.put_u32(8 + content.len() as u32);
        buf.put_slice(box_type);
        buf.put_slice(content);
    }

    fn write_full_box(buf: &mut BytesMut, box_type: &[u8; 4], version: u8, flags: u32, content: &[u8]) {
        let mut full = BytesMut::with_capacity(4 + content.len());
        full.put_u8(version);
        full.put_slice(&flags.to_be_bytes()[1..]);
        full.put_slice(content);
        Self::write_box(buf, box_type, &full);
    }

    fn write_ftyp(buf: &mut BytesMut) {
        let mut content = BytesMut::new();
        content.put_slice(b"isom"); // major brand
        content.put_u32(0x200); // minor version
        content.put_slice(b"isomiso2avc1mp41"); // compatible brands
        Self::write_box(buf, b"ftyp", &content);
    }

    fn write_moov(&self, buf: &mut BytesMut) {
        let mut content = BytesMut::new();
        self.write_mvhd(&mut content);
        for (index, track) in self.tracks.iter().enumerate() {
            Self::write_trak(&mut content, track, index as u32 + 1);
        }
        self.write_mvex(&mut content);
        Self::write_box(buf, b"moov", &content);
    }

    fn write_mvhd(&self, buf: &mut BytesMut) {
        let mut content = BytesMut::new();
        content.put_u32(0); // creation time
        content.put_u32(0); // modification time
        content.put_u32(MOVIE_TIMESCALE);
        content.put_u32(0); // duration, unknown for fragmented output
        content.put_u32(0x00010000); // rate (1.0)
        content.put_u16(0x0100); // volume (1.0)
        content.put_u16(0); // reserved
        content.put_u64(0); // reserved
        Self::put_identity_matrix(&mut content);
        for _ in 0..6 {
            content.put_u32(0); // pre-defined
        }
        content.put_u32(self.tracks.len() as u32 + 1); // next track ID
        Self::write_full_box(buf, b"mvhd", 0, 0, &content);
    }

    fn put_identity_matrix(buf: &mut BytesMut) {
        buf.put_u32(0x00010000);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0x00010000);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0x40000000);
    }

    fn write_trak(buf: &mut BytesMut, track: &Track, track_id: u32) {
        let mut content = BytesMut::new();
        Self::write_tkhd(&mut content, track, track_id);
        Self::write_mdia(&mut content, track);
        Self::write_box(buf, b"trak", &content);
    }

    fn write_tkhd(buf: &mut BytesMut, track: &Track, track_id: u32) {
        let mut content = BytesMut::new();
        content.put_u32(0); // creation time
        content.put_u32(0); // modification time
        content.put_u32(track_id);
        content.put_u32(0); // reserved
        content.put_u32(0); // duration
        content.put_u64(0); // reserved
        content.put_u16(0); // layer
        content.put_u16(0); // alternate group
        match track.kind {
            CodecKind::H264 { .. } => content.put_u16(0), // volume
            CodecKind::Aac { .. } => content.put_u16(0x0100),
        }
        content.put_u16(0); // reserved
        Self::put_identity_matrix(&mut content);
        match track.kind {
            CodecKind::H264 { width, height } => {
                content.put_u32(width << 16); // fixed-point width
                content.put_u32(height << 16);
            }
            CodecKind::Aac { .. } => {
                content.put_u32(0);
                content.put_u32(0);
            }
        }
        // flags: track enabled + in movie
        Self::write_full_box(buf, b"tkhd", 0, 3, &content);
    }

    fn write_mdia(buf: &mut BytesMut, track: &Track) {
        let mut content = BytesMut::new();
        Self::write_mdhd(&mut content, track);
        Self::write_hdlr(&mut content, track);
        Self::write_minf(&mut content, track);
        Self::write_box(buf, b"mdia", &content);
    }

    fn write_mdhd(buf: &mut BytesMut, track: &Track) {
        let mut content = BytesMut::new();
        content.put_u32(0); // creation time
        content.put_u32(0); // modification time
        content.put_u32(track.timescale);
        content.put_u32(0); // duration
        content.put_u16(0x55C4); // language (und)
        content.put_u16(0); // pre-defined
        Self::write_full_box(buf, b"mdhd", 0, 0, &content);
    }

    fn write_hdlr(buf: &mut BytesMut, track: &Track) {
        let mut content = BytesMut::new();
        content.put_u32(0); // pre-defined
        match track.kind {
            CodecKind::H264 { .. } => content.put_slice(b"vide"),
            CodecKind::Aac { .. } => content.put_slice(b"soun"),
        }
        content.put_u32(0); // reserved
        content.put_u32(0);
        content.put_u32(0);
        match track.kind {
            CodecKind::H264 { .. } => content.put_slice(b"VideoHandler\0"),
            CodecKind::Aac { .. } => content.put_slice(b"SoundHandler\0"),
        }
        Self::write_full_box(buf, b"hdlr", 0, 0, &content);
    }

    fn write_minf(buf: &mut BytesMut, track: &Track) {
        let mut content = BytesMut::new();
        match track.kind {
            CodecKind::H264 { .. } => {
                // vmhd, flags = 1
                let mut vmhd = BytesMut::new();
                vmhd.put_u16(0); // graphics mode
                vmhd.put_u16(0); // opcolor
                vmhd.put_u16(0);
                vmhd.put_u16(0);
                Self::write_full_box(&mut content, b"vmhd", 0, 1, &vmhd);
            }
            CodecKind::Aac { .. } => {
                let mut smhd = BytesMut::new();
                smhd.put_u16(0); // balance
                smhd.put_u16(0); // reserved
                Self::write_full_box(&mut content, b"smhd", 0, 0, &smhd);
            }
        }
        Self::write_dinf(&mut content);
        Self::write_stbl(&mut content, track);
        Self::write_box(buf, b"minf", &content);
    }

    fn write_dinf(buf: &mut BytesMut) {
        let mut dref = BytesMut::new();
        dref.put_u32(1); // entry count
        Self::write_full_box(&mut dref, b"url ", 0, 1, &[]); // self-contained
        let mut content = BytesMut::new();
        Self::write_full_box(&mut content, b"dref", 0, 0, &dref);
        Self::write_box(buf, b"dinf", &content);
    }

    fn write_stbl(buf: &mut BytesMut, track: &Track) {
        let mut content = BytesMut::new();
        Self::write_stsd(&mut content, track);
        // Empty sample tables; all samples live in fragments
        let mut stts = BytesMut::new();
        stts.put_u32(0);
        Self::write_full_box(&mut content, b"stts", 0, 0, &stts);
        let mut stsc = BytesMut::new();
        stsc.put_u32(0);
        Self::write_full_box(&mut content, b"stsc", 0, 0, &stsc);
        let mut stsz = BytesMut::new();
        stsz.put_u32(0); // sample size
        stsz.put_u32(0); // sample count
        Self::write_full_box(&mut content, b"stsz", 0, 0, &stsz);
        let mut stco = BytesMut::new();
        stco.put_u32(0);
        Self::write_full_box(&mut content, b"stco", 0, 0, &stco);
        Self::write_box(buf, b"stbl", &content);
    }

    fn write_stsd(buf: &mut BytesMut, track: &Track) {
        let mut content = BytesMut::new();
        content.put_u32(1); // entry count
        match track.kind {
            CodecKind::H264 { width, height } => {
                Self::write_avc1(&mut content, track, width, height)
            }
            CodecKind::Aac {
                sample_rate,
                channels,
            } => Self::write_mp4a(&mut content, track, sample_rate, channels),
        }
        Self::write_full_box(buf, b"stsd", 0, 0, &content);
    }

    fn write_avc1(buf: &mut BytesMut, track: &Track, width: u32, height: u32) {
        let mut content = BytesMut::new();
        content.put_slice(&[0; 6]); // reserved
        content.put_u16(1); // data reference index
        content.put_u16(0); // pre-defined
        content.put_u16(0); // reserved
        content.put_u32(0); // pre-defined
        content.put_u32(0);
        content.put_u32(0);
        content.put_u16(width as u16);
        content.put_u16(height as u16);
        content.put_u32(0x00480000); // horiz resolution (72 dpi)
        content.put_u32(0x00480000); // vert resolution (72 dpi)
        content.put_u32(0); // reserved
        content.put_u16(1); // frame count
        content.put_slice(&[0; 32]); // compressor name
        content.put_u16(0x0018); // depth (24-bit color)
        content.put_i16(-1); // pre-defined
        Self::write_box(&mut content, b"avcC", &track.extradata);
        Self::write_box(buf, b"avc1", &content);
    }

    fn write_mp4a(buf: &mut BytesMut, track: &Track, sample_rate: u32, channels: u16) {
        let mut content = BytesMut::new();
        content.put_slice(&[0; 6]); // reserved
        content.put_u16(1); // data reference index
        content.put_u32(0); // reserved
        content.put_u32(0);
        content.put_u16(channels);
        content.put_u16(16); // sample size in bits
        content.put_u16(0); // pre-defined
        content.put_u16(0); // reserved
        content.put_u32(sample_rate << 16); // fixed-point sample rate
        Self::write_esds(&mut content, &track.extradata);
        Self::write_box(buf, b"mp4a", &content);
    }

    fn write_esds(buf: &mut BytesMut, audio_specific_config: &[u8]) {
        let asc_len = audio_specific_config.len() as u8;
        let mut content = BytesMut::new();
        // ES_Descriptor
        content.put_u8(0x03);
        content.put_u8(asc_len + 23);
        content.put_u16(1); // ES_ID
        content.put_u8(0); // stream dependence / URL / OCR flags
        // DecoderConfigDescriptor
        content.put_u8(0x04);
        content.put_u8(asc_len + 15);
        content.put_u8(0x40); // object type: MPEG-4 audio
        content.put_u8(0x15); // stream type: audio
        content.put_slice(&[0, 0, 0]); // buffer size
        content.put_u32(0); // max bitrate
        content.put_u32(0); // avg bitrate
        // DecoderSpecificInfo
        content.put_u8(0x05);
        content.put_u8(asc_len);
        content.put_slice(audio_specific_config);
        // SLConfigDescriptor
        content.put_u8(0x06);
        content.put_u8(1);
        content.put_u8(0x02);
        Self::write_full_box(buf, b"esds", 0, 0, &content);
    }

    fn write_mvex(&self, buf: &mut BytesMut) {
        let mut content = BytesMut::new();
        for index in 0..self.tracks.len() {
            let mut trex = BytesMut::new();
            trex.put_u32(index as u32 + 1); // track ID
            trex.put_u32(1); // default sample description index
            trex.put_u32(0); // default sample duration
            trex.put_u32(0); // default sample size
            trex.put_u32(0); // default sample flags
            Self::write_full_box(&mut content, b"trex", 0, 0, &trex);
        }
        Self::write_box(buf, b"mvex", &content);
    }

    fn build_fragment(&self, packet: &PacketEnvelope) -> BytesMut {
        let track = &self.tracks[packet.stream_index];
        let decode_time = packet.dts.or(packet.pts).unwrap_or(track.pts).max(0) as u64;
        let sample_flags = match (&track.kind, packet.keyframe) {
            (CodecKind::Aac { .. }, _) | (_, true) => SAMPLE_FLAG_SYNC,
            (_, false) => SAMPLE_FLAG_NON_SYNC,
        };

        let mut traf = BytesMut::new();
        // tfhd, flags = default-base-is-moof
        let mut tfhd = BytesMut::new();
        tfhd.put_u32(packet.stream_index as u32 + 1);
        Self::write_full_box(&mut traf, b"tfhd", 0, 0x020000, &tfhd);
        // tfdt, version 1 for a 64-bit time
        let mut tfdt = BytesMut::new();
        tfdt.put_u64(decode_time);
        Self::write_full_box(&mut traf, b"tfdt", 1, 0, &tfdt);
        // trun, flags = data-offset + sample-duration + sample-size + sample-flags
        let mut trun = BytesMut::new();
        trun.put_u32(1); // sample count
        trun.put_u32(0); // data offset, patched below
        trun.put_u32(packet.duration.max(0) as u32);
        trun.put_u32(packet.data.len() as u32);
        trun.put_u32(sample_flags);
        Self::write_full_box(&mut traf, b"trun", 0, 0x000701, &trun);

        let mut moof_content = BytesMut::new();
        let mut mfhd = BytesMut::new();
        mfhd.put_u32(self.sequence_number);
        Self::write_full_box(&mut moof_content, b"mfhd", 0, 0, &mfhd);
        Self::write_box(&mut moof_content, b"traf", &traf);

        let mut buf = BytesMut::new();
        Self::write_box(&mut buf, b"moof", &moof_content);

        // The trun is the last box in the moof and ends with data offset,
        // duration, size and flags; the data offset sits 16 bytes from the
        // end and points just past the mdat header.
        let moof_len = buf.len();
        let data_offset = (moof_len + 8) as u32;
        buf[moof_len - 16..moof_len - 12].copy_from_slice(&data_offset.to_be_bytes());

        buf.put_u32(8 + packet.data.len() as u32);
        buf.put_slice(b"mdat");
        buf.put_slice(&packet.data);
        buf
    }
}

impl ContainerWriter for Fmp4Writer {
    fn add_stream(&mut self, params: &StreamParams) -> MuxerResult<usize> {
        if self.header_written {
            return Err(MuxerError::StreamSetup(
                "streams cannot be added after the header".to_string(),
            ));
        }
        if params.extradata.is_empty() {
            return Err(MuxerError::StreamSetup(
                "codec configuration (extradata) is required".to_string(),
            ));
        }
        let timescale = match params.kind {
            CodecKind::H264 { .. } => VIDEO_TIMESCALE,
            CodecKind::Aac { sample_rate, .. } => sample_rate,
        };
        self.tracks.push(Track {
            kind: params.kind.clone(),
            extradata: params.extradata.clone(),
            timescale,
            pts: 0,
        });
        Ok(self.tracks.len() - 1)
    }

    fn write_header(&mut self) -> MuxerResult<()> {
        let mut buf = BytesMut::new();
        Self::write_ftyp(&mut buf);
        self.write_moov(&mut buf);
        self.put(&buf).map_err(MuxerError::WriteHeader)?;
        self.header_written = true;
        debug!("fMP4 header written, {} tracks", self.tracks.len());
        Ok(())
    }

    fn write_packet(&mut self, packet: PacketEnvelope) -> MuxerResult<()> {
        if packet.stream_index >= self.tracks.len() {
            return Err(MuxerError::InvalidStream(packet.stream_index));
        }
        let fragment = self.build_fragment(&packet);
        self.put(&fragment).map_err(MuxerError::WritePacket)?;
        self.sequence_number += 1;

        let track = &mut self.tracks[packet.stream_index];
        let start = packet.pts.or(packet.dts).unwrap_or(track.pts);
        track.pts = track.pts.max(start + packet.duration.max(1));
        Ok(())
    }

    fn write_trailer(&mut self) -> MuxerResult<()> {
        // Fragmented output needs no trailer box, just a flush
        self.file.flush().map_err(MuxerError::WriteTrailer)
    }

    fn stream_count(&self) -> usize {
        self.tracks.len()
    }

    fn stream_time_base(&self, index: usize) -> Rational {
        Rational::new(1, self.tracks[index].timescale as i64)
    }

    fn stream_pts(&self, index: usize) -> i64 {
        self.tracks[index].pts
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::rescale;
    use tempfile::tempdir;

    fn video_params() -> StreamParams {
        StreamParams {
            kind: CodecKind::H264 {
                width: 640,
                height: 480,
            },
            codec_time_base: Rational::new(1, 30),
            extradata: vec![1, 0x64, 0, 0x1F, 0xFF, 0xE1, 0, 2, 0x67, 0x64, 1, 0, 2, 0x68, 0xEE],
        }
    }

    fn audio_params() -> StreamParams {
        StreamParams {
            kind: CodecKind::Aac {
                sample_rate: 48_000,
                channels: 2,
            },
            codec_time_base: Rational::new(1, 48_000),
            extradata: vec![0x11, 0x90],
        }
    }

    /// Walk top-level boxes and return their four-character codes
    fn box_types(data: &[u8]) -> Vec<String> {
        let mut types = Vec::new();
        let mut pos = 0;
        while pos + 8 <= data.len() {
            let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            types.push(String::from_utf8_lossy(&data[pos + 4..pos + 8]).into_owned());
            assert!(size >= 8, "degenerate box at {}", pos);
            pos += size;
        }
        assert_eq!(pos, data.len(), "trailing garbage");
        types
    }

    #[test]
    fn header_lays_out_ftyp_then_moov() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("header.mp4");
        let mut writer = Fmp4Writer::create(&path).unwrap();
        writer.add_stream(&video_params()).unwrap();
        writer.add_stream(&audio_params()).unwrap();
        writer.write_header().unwrap();
        writer.write_trailer().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(box_types(&data), ["ftyp", "moov"]);
        assert_eq!(writer.bytes_written(), data.len() as u64);
    }

    #[test]
    fn each_packet_becomes_a_fragment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("frags.mp4");
        let mut writer = Fmp4Writer::create(&path).unwrap();
        writer.add_stream(&video_params()).unwrap();
        writer.write_header().unwrap();

        for i in 0..3 {
            let mut packet = PacketEnvelope::new(vec![0xAB; 100 + i], (i as i64) * 3000)
                .with_duration(3000);
            packet.stream_index = 0;
            writer.write_packet(packet).unwrap();
        }
        writer.write_trailer().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(
            box_types(&data),
            ["ftyp", "moov", "moof", "mdat", "moof", "mdat", "moof", "mdat"]
        );
        // The payload of the last mdat is intact
        assert!(data.ends_with(&[0xAB; 102][..]));
    }

    #[test]
    fn stream_pts_tracks_packet_ends() {
        let dir = tempdir().unwrap();
        let mut writer = Fmp4Writer::create(dir.path().join("pts.mp4")).unwrap();
        writer.add_stream(&video_params()).unwrap();
        writer.write_header().unwrap();

        assert_eq!(writer.stream_pts(0), 0);
        let tb = writer.stream_time_base(0);
        assert_eq!(tb, Rational::new(1, 90_000));

        let pts = rescale(1, Rational::new(1, 30), tb);
        let mut packet = PacketEnvelope::new(vec![0; 10], pts).with_duration(3000);
        packet.stream_index = 0;
        writer.write_packet(packet).unwrap();
        assert_eq!(writer.stream_pts(0), 6000);
    }

    #[test]
    fn rejects_streams_without_extradata() {
        let dir = tempdir().unwrap();
        let mut writer = Fmp4Writer::create(dir.path().join("bad.mp4")).unwrap();
        let mut params = video_params();
        params.extradata.clear();
        assert!(writer.add_stream(&params).is_err());
    }

    #[test]
    fn rejects_unknown_stream_index() {
        let dir = tempdir().unwrap();
        let mut writer = Fmp4Writer::create(dir.path().join("idx.mp4")).unwrap();
        writer.add_stream(&video_params()).unwrap();
        writer.write_header().unwrap();

        let mut packet = PacketEnvelope::new(vec![0; 4], 0);
        packet.stream_index = 5;
        assert!(matches!(
            writer.write_packet(packet),
            Err(MuxerError::InvalidStream(5))
        ));
    }

    #[test]
    fn data_offset_points_at_the_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("off.mp4");
        let mut writer = Fmp4Writer::create(&path).unwrap();
        writer.add_stream(&video_params()).unwrap();
        writer.write_header().unwrap();
        let header_len = writer.bytes_written() as usize;

        let payload = vec![0xC3; 37];
        let mut packet = PacketEnvelope::new(payload.clone(), 0).with_duration(3000);
        packet.stream_index = 0;
        writer.write_packet(packet).unwrap();
        writer.write_trailer().unwrap();

        let data = std::fs::read(&path).unwrap();
        let moof = &data[header_len..];
        let moof_size = u32::from_be_bytes(moof[0..4].try_into().unwrap()) as usize;
        let data_offset =
            u32::from_be_bytes(moof[moof_size - 16..moof_size - 12].try_into().unwrap()) as usize;
        assert_eq!(&moof[data_offset..data_offset + payload.len()], &payload[..]);
    }
}
