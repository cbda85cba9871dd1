use super::xxhash::{hash_data, PARTIAL_HASH_LENGTH};
use super::ContentHash;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";
const PNG_METADATA_CHUNKS: [&[u8; 4]; 4] = [b"tEXt", b"zTXt", b"iTXt", b"tIME"];
const ID3V1_LEN: usize = 128;
const SNIFF_LEN: usize = 10;
const PNG_MAX_CHUNK_LEN: u32 = 0x7FFF_FFFF;

/// Hash a file on disk. Unreadable files surface as `Error::FileAccess`.
pub fn hash_file(path: &Path) -> crate::Result<ContentHash> {
    let file =
        File::open(path).map_err(|e| crate::Error::file_access(path.display().to_string(), e))?;
    hash_reader(file).map_err(|e| crate::Error::file_access(path.display().to_string(), e))
}

pub fn hash_reader(mut reader: impl Read) -> io::Result<ContentHash> {
    let mut hasher = ContentHasher::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hasher.finalize())
}

pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[derive(Debug, Clone, Copy)]
enum State {
    Sniff,
    Raw,
    SkipId3 { remaining: u64 },
    /// Waiting for two consecutive MPEG frame headers.
    MpegSync,
    Mpeg,
    PngHeader,
    PngKeep { remaining: u64 },
    PngSkip { remaining: u64 },
    /// The stream did not hold up as the format it looked like; only the
    /// raw hasher counts.
    Fallback,
}

/// Incremental hasher applying the canonical (metadata-free) view.
///
/// Bytes may arrive in chunks of any size; the result depends only on the
/// concatenated stream. Metadata is only dropped from streams that parse as
/// the format they claim to be. Anything else, including a tag running past
/// the end of the stream, hashes as the full byte stream.
pub struct ContentHasher {
    hasher: blake3::Hasher,
    /// Full-stream hash kept while a canonical view may still be abandoned.
    raw: Option<blake3::Hasher>,
    state: State,
    pending: Vec<u8>,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            raw: None,
            state: State::Sniff,
            pending: Vec::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        if let Some(raw) = self.raw.as_mut() {
            raw.update(data);
        }
        self.pending.extend_from_slice(data);
        self.advance(false);
    }

    pub fn finalize(mut self) -> ContentHash {
        self.advance(true);
        let complete = match self.state {
            State::Mpeg => {
                let is_id3v1 =
                    self.pending.len() == ID3V1_LEN && self.pending.starts_with(b"TAG");
                if !is_id3v1 {
                    self.hasher.update(&self.pending);
                }
                true
            }
            State::PngHeader => self.pending.is_empty(),
            State::SkipId3 { .. }
            | State::PngKeep { .. }
            | State::PngSkip { .. }
            | State::Fallback => false,
            State::Sniff | State::Raw | State::MpegSync => {
                self.hasher.update(&self.pending);
                true
            }
        };
        match self.raw {
            Some(raw) if !complete => ContentHash::from_digest(raw.finalize()),
            _ => ContentHash::from_digest(self.hasher.finalize()),
        }
    }

    fn consume(&mut self, n: usize, keep: bool) {
        if keep {
            self.hasher.update(&self.pending[..n]);
        }
        self.pending.drain(..n);
    }

    /// Give up on the canonical view. Before anything was dropped the
    /// canonical hasher still sees every byte, so plain hashing continues.
    fn fall_back(&self) -> State {
        if self.raw.is_some() {
            State::Fallback
        } else {
            State::Raw
        }
    }

    fn advance(&mut self, eof: bool) {
        loop {
            match self.state {
                State::Sniff => {
                    if self.pending.len() < SNIFF_LEN && !eof {
                        return;
                    }
                    self.state = self.sniff();
                }
                State::Raw => {
                    let n = self.pending.len();
                    self.consume(n, true);
                    return;
                }
                State::Fallback => {
                    let n = self.pending.len();
                    self.consume(n, false);
                    return;
                }
                State::SkipId3 { remaining } => {
                    let n = (remaining as usize).min(self.pending.len());
                    self.consume(n, false);
                    let remaining = remaining - n as u64;
                    if remaining > 0 {
                        self.state = State::SkipId3 { remaining };
                        return;
                    }
                    self.state = State::MpegSync;
                }
                State::MpegSync => {
                    if self.pending.len() < 4 {
                        if !eof {
                            return;
                        }
                        self.state = self.fall_back();
                        continue;
                    }
                    let Some(frame_len) = mpeg_frame_len(&self.pending[..4]) else {
                        self.state = self.fall_back();
                        continue;
                    };
                    if self.pending.len() < frame_len + 4 {
                        if !eof {
                            return;
                        }
                        self.state = self.fall_back();
                        continue;
                    }
                    if mpeg_frame_len(&self.pending[frame_len..frame_len + 4]).is_none() {
                        self.state = self.fall_back();
                        continue;
                    }
                    self.raw = None;
                    self.state = State::Mpeg;
                }
                State::Mpeg => {
                    // Hold back a possible ID3v1 trailer until the stream ends.
                    if self.pending.len() > ID3V1_LEN {
                        let n = self.pending.len() - ID3V1_LEN;
                        self.consume(n, true);
                    }
                    return;
                }
                State::PngHeader => {
                    if self.pending.len() < 8 {
                        return;
                    }
                    let len = u32::from_be_bytes([
                        self.pending[0],
                        self.pending[1],
                        self.pending[2],
                        self.pending[3],
                    ]);
                    let chunk_type = &self.pending[4..8];
                    if len > PNG_MAX_CHUNK_LEN || !chunk_type.iter().all(u8::is_ascii_alphabetic) {
                        self.state = self.fall_back();
                        continue;
                    }
                    let skip = PNG_METADATA_CHUNKS
                        .iter()
                        .any(|ty| chunk_type == ty.as_slice());
                    self.consume(8, !skip);
                    // chunk data plus trailing CRC
                    let remaining = u64::from(len) + 4;
                    self.state = if skip {
                        State::PngSkip { remaining }
                    } else {
                        State::PngKeep { remaining }
                    };
                }
                State::PngKeep { remaining } | State::PngSkip { remaining } => {
                    let keep = matches!(self.state, State::PngKeep { .. });
                    let n = (remaining as usize).min(self.pending.len());
                    self.consume(n, keep);
                    let remaining = remaining - n as u64;
                    if remaining > 0 {
                        self.state = if keep {
                            State::PngKeep { remaining }
                        } else {
                            State::PngSkip { remaining }
                        };
                        return;
                    }
                    self.state = State::PngHeader;
                }
            }
        }
    }

    fn sniff(&mut self) -> State {
        if let Some(tag_len) = id3v2_tag_len(&self.pending) {
            self.start_raw();
            return State::SkipId3 { remaining: tag_len };
        }
        if self.pending.starts_with(PNG_SIGNATURE) {
            self.start_raw();
            self.consume(PNG_SIGNATURE.len(), true);
            return State::PngHeader;
        }
        if self.pending.len() >= 4 && mpeg_frame_len(&self.pending[..4]).is_some() {
            return State::MpegSync;
        }
        State::Raw
    }

    /// Nothing has been consumed yet when this runs, so `pending` is the
    /// whole stream so far.
    fn start_raw(&mut self) {
        let mut raw = blake3::Hasher::new();
        raw.update(&self.pending);
        self.raw = Some(raw);
    }
}

impl io::Write for ContentHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Total length of a well-formed ID3v2 header at the start of `head`,
/// including the 10-byte header and optional footer.
fn id3v2_tag_len(head: &[u8]) -> Option<u64> {
    if head.len() < SNIFF_LEN || !head.starts_with(b"ID3") {
        return None;
    }
    let (major, revision, flags) = (head[3], head[4], head[5]);
    if major == 0xFF || revision == 0xFF || flags & 0x0F != 0 {
        return None;
    }
    let size = &head[6..10];
    if size.iter().any(|b| b & 0x80 != 0) {
        return None;
    }
    let size = size.iter().fold(0u64, |acc, b| (acc << 7) | u64::from(*b));
    let footer = if flags & 0x10 != 0 { 10 } else { 0 };
    Some(10 + size + footer)
}

// kbps by bitrate index; index 0 (free format) and 15 are rejected earlier.
const V1_L1_KBPS: [u32; 15] = [
    0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448,
];
const V1_L2_KBPS: [u32; 15] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384,
];
const V1_L3_KBPS: [u32; 15] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320,
];
const V2_L1_KBPS: [u32; 15] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256,
];
const V2_L23_KBPS: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

/// Frame length in bytes if `header` is a valid MPEG audio frame header.
fn mpeg_frame_len(header: &[u8]) -> Option<usize> {
    let [b0, b1, b2, b3] = *header else {
        return None;
    };
    if b0 != 0xFF || b1 & 0xE0 != 0xE0 {
        return None;
    }
    // version: 0 = 2.5, 1 = reserved, 2 = 2, 3 = 1
    let version = (b1 >> 3) & 0x03;
    // layer: 0 = reserved, 1 = III, 2 = II, 3 = I
    let layer = (b1 >> 1) & 0x03;
    let bitrate_index = usize::from(b2 >> 4);
    let rate_index = usize::from((b2 >> 2) & 0x03);
    let padding = u32::from((b2 >> 1) & 0x01);
    let emphasis = b3 & 0x03;
    if version == 1
        || layer == 0
        || bitrate_index == 0
        || bitrate_index == 15
        || rate_index == 3
        || emphasis == 2
    {
        return None;
    }

    let mpeg1 = version == 3;
    let kbps = match (mpeg1, layer) {
        (true, 3) => V1_L1_KBPS,
        (true, 2) => V1_L2_KBPS,
        (true, _) => V1_L3_KBPS,
        (false, 3) => V2_L1_KBPS,
        (false, _) => V2_L23_KBPS,
    };
    let bitrate = kbps[bitrate_index] * 1000;
    let sample_rate = [44_100u32, 48_000, 32_000][rate_index]
        >> match version {
            3 => 0,
            2 => 1,
            _ => 2,
        };

    let len = match layer {
        3 => (12 * bitrate / sample_rate + padding) * 4,
        1 if !mpeg1 => 72 * bitrate / sample_rate + padding,
        _ => 144 * bitrate / sample_rate + padding,
    };
    Some(len as usize)
}

/// Reader adapter that hashes every byte passing through it. The first
/// kilobyte is kept so the partial fingerprint comes out of the same pass.
pub struct HashingReader<R> {
    inner: R,
    hasher: ContentHasher,
    bytes: u64,
    head: Vec<u8>,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: ContentHasher::new(),
            bytes: 0,
            head: Vec::with_capacity(PARTIAL_HASH_LENGTH),
        }
    }

    /// XxHash64 of the first 1KB seen so far.
    pub fn partial_hash(&self) -> u64 {
        hash_data(&self.head)
    }

    pub fn finish(self) -> (ContentHash, u64) {
        (self.hasher.finalize(), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        if self.head.len() < PARTIAL_HASH_LENGTH {
            let take = n.min(PARTIAL_HASH_LENGTH - self.head.len());
            self.head.extend_from_slice(&buf[..take]);
        }
        self.bytes += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// MPEG-1 Layer III, 128 kbps, 44.1 kHz, no padding: 417-byte frames.
    const FRAME_HEADER: [u8; 4] = [0xFF, 0xFB, 0x90, 0x00];
    const FRAME_LEN: usize = 417;

    fn mp3_frames(count: usize, seed: u8) -> Vec<u8> {
        let mut audio = Vec::with_capacity(count * FRAME_LEN);
        for i in 0..count {
            audio.extend_from_slice(&FRAME_HEADER);
            audio.extend((0..FRAME_LEN - 4).map(|j| (j as u8).wrapping_add(seed).wrapping_add(i as u8)));
        }
        audio
    }

    fn id3v2(payload_len: usize) -> Vec<u8> {
        let mut tag = b"ID3\x03\x00\x00".to_vec();
        let size = payload_len as u32;
        tag.extend_from_slice(&[
            ((size >> 21) & 0x7F) as u8,
            ((size >> 14) & 0x7F) as u8,
            ((size >> 7) & 0x7F) as u8,
            (size & 0x7F) as u8,
        ]);
        tag.extend(std::iter::repeat(b'x').take(payload_len));
        tag
    }

    fn id3v1() -> Vec<u8> {
        let mut trailer = b"TAG".to_vec();
        trailer.resize(ID3V1_LEN, b' ');
        trailer
    }

    fn png_chunk(ty: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut chunk = (data.len() as u32).to_be_bytes().to_vec();
        chunk.extend_from_slice(ty);
        chunk.extend_from_slice(data);
        chunk.extend_from_slice(&[0, 0, 0, 0]);
        chunk
    }

    fn chunked(data: &[u8], size: usize) -> ContentHash {
        let mut hasher = ContentHasher::new();
        for chunk in data.chunks(size) {
            hasher.update(chunk);
        }
        hasher.finalize()
    }

    #[test]
    fn test_hash_is_deterministic_across_chunking() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(hash_bytes(&data), chunked(&data, 7));

        let mut tagged = id3v2(300);
        tagged.extend(mp3_frames(3, 1));
        tagged.extend(id3v1());
        assert_eq!(hash_bytes(&tagged), chunked(&tagged, 5));
    }

    #[test]
    fn test_frame_header_lengths() {
        assert_eq!(mpeg_frame_len(&FRAME_HEADER), Some(FRAME_LEN));
        // padding bit adds a byte
        assert_eq!(mpeg_frame_len(&[0xFF, 0xFB, 0x92, 0x00]), Some(FRAME_LEN + 1));
        // free-format and reserved bitrates, reserved sample rate, reserved version
        assert_eq!(mpeg_frame_len(&[0xFF, 0xFB, 0x00, 0x00]), None);
        assert_eq!(mpeg_frame_len(&[0xFF, 0xFB, 0xF0, 0x00]), None);
        assert_eq!(mpeg_frame_len(&[0xFF, 0xFB, 0x9C, 0x00]), None);
        assert_eq!(mpeg_frame_len(&[0xFF, 0xEB, 0x90, 0x00]), None);
    }

    #[test]
    fn test_id3v2_tag_does_not_affect_identity() {
        let audio = mp3_frames(3, 0);
        let mut a = id3v2(20);
        a.extend_from_slice(&audio);
        let mut b = id3v2(300);
        b.extend_from_slice(&audio);
        assert_eq!(hash_bytes(&a), hash_bytes(&b));
        assert_eq!(hash_bytes(&a), hash_bytes(&audio));
    }

    #[test]
    fn test_id3v1_trailer_is_stripped() {
        let audio = mp3_frames(2, 9);
        let mut tagged = audio.clone();
        tagged.extend(id3v1());
        assert_eq!(hash_bytes(&audio), hash_bytes(&tagged));
    }

    #[test]
    fn test_text_starting_with_id3_is_hashed_whole() {
        let budget = hash_bytes(b"ID3 notes: the quarterly budget is 10k");
        let plan = hash_bytes(b"ID3 notes: delete nothing, totally different");
        assert_ne!(budget, plan);
        assert_ne!(budget, hash_bytes(b""));
        assert_eq!(budget, ContentHash::from_digest(blake3::hash(b"ID3 notes: the quarterly budget is 10k")));
    }

    #[test]
    fn test_id3v2_tag_longer_than_stream_is_hashed_whole() {
        let mut a = id3v2(0);
        a[9] = 0x7F; // declares 127 bytes that never arrive
        a.extend_from_slice(b"short tail one");
        let mut b = a.clone();
        b.extend_from_slice(b" and two");
        assert_ne!(hash_bytes(&a), hash_bytes(&b));
        assert_eq!(hash_bytes(&a), ContentHash::from_digest(blake3::hash(&a)));
    }

    #[test]
    fn test_id3v2_without_audio_frames_is_hashed_whole() {
        let mut a = id3v2(10);
        a.extend_from_slice(b"plain text after a tag");
        let mut b = id3v2(40);
        b.extend_from_slice(b"plain text after a tag");
        assert_ne!(hash_bytes(&a), hash_bytes(&b));
    }

    #[test]
    fn test_sync_bytes_without_frames_keep_trailer() {
        let mut body = vec![0xFF, 0xFB, 0x90, 0x00];
        body.extend_from_slice(b"not really audio");
        let mut a = body.clone();
        a.extend(id3v1());
        let mut trailer = id3v1();
        trailer[3] = b'X';
        let mut b = body.clone();
        b.extend(trailer);
        assert_ne!(hash_bytes(&a), hash_bytes(&b));
        assert_ne!(hash_bytes(&a), hash_bytes(&body));
    }

    #[test]
    fn test_png_text_chunks_are_ignored() {
        let mut plain = PNG_SIGNATURE.to_vec();
        plain.extend(png_chunk(b"IHDR", &[0; 13]));
        plain.extend(png_chunk(b"IDAT", &[1, 2, 3, 4]));
        plain.extend(png_chunk(b"IEND", &[]));

        let mut annotated = PNG_SIGNATURE.to_vec();
        annotated.extend(png_chunk(b"IHDR", &[0; 13]));
        annotated.extend(png_chunk(b"tEXt", b"Comment\0tagged later"));
        annotated.extend(png_chunk(b"IDAT", &[1, 2, 3, 4]));
        annotated.extend(png_chunk(b"IEND", &[]));

        assert_eq!(hash_bytes(&plain), hash_bytes(&annotated));
    }

    #[test]
    fn test_png_pixel_change_changes_identity() {
        let mut a = PNG_SIGNATURE.to_vec();
        a.extend(png_chunk(b"IDAT", &[1, 2, 3, 4]));
        let mut b = PNG_SIGNATURE.to_vec();
        b.extend(png_chunk(b"IDAT", &[1, 2, 3, 5]));
        assert_ne!(hash_bytes(&a), hash_bytes(&b));
    }

    #[test]
    fn test_truncated_png_text_chunk_is_hashed_whole() {
        let mut a = PNG_SIGNATURE.to_vec();
        a.extend(png_chunk(b"IHDR", &[0; 13]));
        a.extend_from_slice(&1000u32.to_be_bytes());
        a.extend_from_slice(b"tEXtfirst version");
        let mut b = a.clone();
        b.truncate(a.len() - 7);
        b.extend_from_slice(b"second");
        assert_ne!(hash_bytes(&a), hash_bytes(&b));
    }

    #[test]
    fn test_short_and_empty_inputs() {
        assert_eq!(hash_bytes(b""), hash_bytes(b""));
        assert_ne!(hash_bytes(b"ID3"), hash_bytes(b"ID"));
        assert_ne!(hash_bytes(&[0xFF, 0xFB]), hash_bytes(b""));
    }

    #[test]
    fn test_hashing_reader_matches_hash_bytes() {
        let data = b"some plain document bytes".repeat(100);
        let mut reader = HashingReader::new(&data[..]);
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();
        assert_eq!(
            reader.partial_hash(),
            crate::hasher::partial_hash_reader(&data[..]).unwrap()
        );
        let (hash, bytes) = reader.finish();
        assert_eq!(bytes, data.len() as u64);
        assert_eq!(hash, hash_bytes(&data));
    }
}
