//! ISO-BMFF ancillary box scanner
//!
//! Walks the top-level boxes of a segment looking for `emsg` (inband
//! events), `prft` (producer reference time) and the `moov/trak/mdia/mdhd`
//! timescale of an init segment. Media payload boxes (`moof`, `mdat`)
//! are skipped untouched.

use bytes::Bytes;

/// Raw `emsg` box contents, version differences preserved.
#[derive(Debug, Clone)]
pub struct EmsgBox {
    pub version: u8,
    pub scheme_id_uri: String,
    pub value: String,
    pub timescale: u32,
    /// v0 only: delta from the segment start, in `timescale` units.
    pub presentation_time_delta: u32,
    /// v1 only: absolute media time, in `timescale` units.
    pub presentation_time: u64,
    pub event_duration: u32,
    pub id: u32,
    pub message_data: Bytes,
}

/// Raw `prft` box contents.
#[derive(Debug, Clone)]
pub struct PrftBox {
    pub version: u8,
    pub reference_track_id: u32,
    /// 64-bit NTP timestamp: seconds since 1900 in the high word,
    /// 2^-32 fractions in the low word.
    pub ntp_timestamp: u64,
    /// Media time in the track timescale.
    pub media_time: u64,
}

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch.
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

impl PrftBox {
    /// Wall-clock time of `ntp_timestamp` in Unix milliseconds.
    pub fn wall_clock_time_ms(&self) -> f64 {
        let seconds = self.ntp_timestamp >> 32;
        let fraction = self.ntp_timestamp & 0xFFFF_FFFF;
        let unix_secs = seconds.wrapping_sub(NTP_UNIX_OFFSET_SECS);
        unix_secs as f64 * 1000.0 + (fraction as f64 * 1000.0) / 4_294_967_296.0
    }

    /// Wall-clock time at which media time zero played out.
    pub fn program_start_ms(&self, timescale: u32) -> f64 {
        self.wall_clock_time_ms() - (self.media_time as f64 / timescale as f64) * 1000.0
    }
}

/// Everything one scan pass found.
#[derive(Debug, Default)]
pub struct BoxScan {
    pub emsg: Vec<EmsgBox>,
    pub prft: Vec<PrftBox>,
    /// Timescale from `moov/trak/mdia/mdhd` (init segments only).
    pub mdhd_timescale: Option<u32>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Option<u64> {
        let bytes = self.data.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_fourcc(&mut self) -> Option<[u8; 4]> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(bytes.try_into().unwrap())
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.remaining() < n {
            return None;
        }
        self.pos += n;
        Some(())
    }

    /// Null-terminated UTF-8 string; consumes the terminator.
    fn read_cstring(&mut self) -> Option<String> {
        let rest = &self.data[self.pos..];
        let nul = rest.iter().position(|&b| b == 0)?;
        let s = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Some(s)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(bytes)
    }
}

/// One box header: fourcc plus payload bounds.
struct BoxHeader {
    fourcc: [u8; 4],
    payload_start: usize,
    payload_end: usize,
}

fn read_box_header(r: &mut Reader<'_>) -> Option<BoxHeader> {
    let box_start = r.pos;
    let size32 = r.read_u32()?;
    let fourcc = r.read_fourcc()?;
    let size = match size32 {
        0 => (r.data.len() - box_start) as u64,
        1 => r.read_u64()?,
        n => n as u64,
    };
    if size < (r.pos - box_start) as u64 {
        return None;
    }
    let payload_start = r.pos;
    let payload_end = box_start + size as usize;
    if payload_end > r.data.len() {
        return None;
    }
    Some(BoxHeader {
        fourcc,
        payload_start,
        payload_end,
    })
}

fn parse_emsg(payload: &[u8]) -> Option<EmsgBox> {
    let mut r = Reader::new(payload);
    let version = r.read_u8()?;
    r.skip(3)?; // flags
    match version {
        0 => {
            let scheme_id_uri = r.read_cstring()?;
            let value = r.read_cstring()?;
            let timescale = r.read_u32()?;
            let presentation_time_delta = r.read_u32()?;
            let event_duration = r.read_u32()?;
            let id = r.read_u32()?;
            let message_data = Bytes::copy_from_slice(r.take(r.remaining())?);
            Some(EmsgBox {
                version,
                scheme_id_uri,
                value,
                timescale,
                presentation_time_delta,
                presentation_time: 0,
                event_duration,
                id,
                message_data,
            })
        }
        1 => {
            let timescale = r.read_u32()?;
            let presentation_time = r.read_u64()?;
            let event_duration = r.read_u32()?;
            let id = r.read_u32()?;
            let scheme_id_uri = r.read_cstring()?;
            let value = r.read_cstring()?;
            let message_data = Bytes::copy_from_slice(r.take(r.remaining())?);
            Some(EmsgBox {
                version,
                scheme_id_uri,
                value,
                timescale,
                presentation_time_delta: 0,
                presentation_time,
                event_duration,
                id,
                message_data,
            })
        }
        _ => None,
    }
}

fn parse_prft(payload: &[u8]) -> Option<PrftBox> {
    let mut r = Reader::new(payload);
    let version = r.read_u8()?;
    r.skip(3)?;
    let reference_track_id = r.read_u32()?;
    let ntp_timestamp = r.read_u64()?;
    let media_time = match version {
        0 => r.read_u32()? as u64,
        _ => r.read_u64()?,
    };
    Some(PrftBox {
        version,
        reference_track_id,
        ntp_timestamp,
        media_time,
    })
}

fn parse_mdhd(payload: &[u8]) -> Option<u32> {
    let mut r = Reader::new(payload);
    let version = r.read_u8()?;
    r.skip(3)?;
    match version {
        0 => {
            // creation_time, modification_time
            r.skip(8)?;
        }
        1 => {
            r.skip(16)?;
        }
        _ => return None,
    }
    r.read_u32()
}

/// Walk the children of a container looking for the mdhd timescale.
fn scan_for_mdhd(data: &[u8]) -> Option<u32> {
    let mut r = Reader::new(data);
    while r.remaining() >= 8 {
        let header = read_box_header(&mut r)?;
        let payload = &data[header.payload_start..header.payload_end];
        match &header.fourcc {
            b"trak" | b"mdia" => {
                if let Some(ts) = scan_for_mdhd(payload) {
                    return Some(ts);
                }
            }
            b"mdhd" => return parse_mdhd(payload),
            _ => {}
        }
        r.pos = header.payload_end;
    }
    None
}

/// Scan a segment for ancillary boxes.
///
/// Malformed trailing data ends the scan with whatever was collected;
/// a segment is never rejected for carrying boxes we cannot read.
pub fn scan(data: &[u8]) -> BoxScan {
    let mut out = BoxScan::default();
    let mut r = Reader::new(data);
    while r.remaining() >= 8 {
        let header = match read_box_header(&mut r) {
            Some(h) => h,
            None => {
                tracing::warn!("malformed box header, stopping ancillary scan");
                break;
            }
        };
        let payload = &data[header.payload_start..header.payload_end];
        match &header.fourcc {
            b"emsg" => {
                if let Some(emsg) = parse_emsg(payload) {
                    out.emsg.push(emsg);
                } else {
                    tracing::warn!("unparseable emsg box skipped");
                }
            }
            b"prft" => {
                if let Some(prft) = parse_prft(payload) {
                    out.prft.push(prft);
                }
            }
            b"moov" => {
                out.mdhd_timescale = scan_for_mdhd(payload);
            }
            _ => {}
        }
        r.pos = header.payload_end;
    }
    out
}
