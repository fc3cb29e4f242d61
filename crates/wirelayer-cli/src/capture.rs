use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::*;
use sha2::{Digest, Sha256};

use wirelayer_core::models::{CapturedFrame, LinkType};

const NANOSECOND_MAGIC: u32 = 0xa1b2_3c4d;

/// Frames read from a pcap or pcapng file, numbered from 1 in file order.
pub struct CaptureFile {
    pub filename: String,
    pub file_sha256: String,
    pub file_size: u64,
    pub link_type: LinkType,
    pub frames: Vec<CapturedFrame>,
    pub parse_errors: u64,
}

impl CaptureFile {
    pub fn from_file(path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let mut buf = Vec::new();
        File::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?
            .read_to_end(&mut buf)
            .with_context(|| format!("cannot read {}", path.display()))?;

        let capture = Self::from_bytes(filename, &buf)?;
        tracing::info!(
            file = %capture.filename,
            size = capture.file_size,
            sha256 = %capture.file_sha256,
            frames = capture.frames.len(),
            errors = capture.parse_errors,
            "capture read"
        );
        Ok(capture)
    }

    pub fn from_bytes(filename: String, buf: &[u8]) -> Result<Self> {
        let mut capture = Self {
            filename,
            file_sha256: hex::encode(Sha256::digest(buf)),
            file_size: buf.len() as u64,
            link_type: LinkType::Ethernet,
            frames: Vec::new(),
            parse_errors: 0,
        };

        if buf.starts_with(&[0x0a, 0x0d, 0x0d, 0x0a]) {
            capture.read_pcapng(buf)?;
        } else {
            capture.read_pcap(buf)?;
        }
        Ok(capture)
    }

    fn push(&mut self, timestamp: DateTime<Utc>, data: &[u8], origlen: u32) {
        self.frames.push(CapturedFrame {
            frame_number: self.frames.len() as u64 + 1,
            timestamp,
            data: data.to_vec(),
            size: origlen.max(data.len() as u32),
        });
    }

    fn read_pcap(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = LegacyPcapReader::new(65536, data).context("failed to create pcap reader")?;
        let mut nanos = false;
        let mut stalled = false;

        loop {
            match reader.next() {
                Ok((consumed, block)) => {
                    stalled = false;
                    match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            self.link_type = link_type(header.network)?;
                            nanos = header.magic_number == NANOSECOND_MAGIC;
                        }
                        PcapBlockOwned::Legacy(packet) => {
                            let frac = if nanos { packet.ts_usec } else { packet.ts_usec.saturating_mul(1000) };
                            let ts = to_datetime(packet.ts_sec as i64, frac);
                            self.push(ts, packet.data, packet.origlen);
                        }
                        _ => {}
                    }
                    reader.consume(consumed);
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete(_)) => {
                    if stalled {
                        tracing::warn!(frames = self.frames.len(), "capture ends with a truncated record");
                        self.parse_errors += 1;
                        break;
                    }
                    stalled = true;
                    reader
                        .refill()
                        .map_err(|e| anyhow::anyhow!("failed to refill pcap buffer: {:?}", e))?;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pcap parse error");
                    self.parse_errors += 1;
                    break;
                }
            }
        }
        Ok(())
    }

    fn read_pcapng(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = PcapNGReader::new(65536, data).context("failed to create pcapng reader")?;
        let mut if_tsresol: u64 = 1_000_000;
        let mut stalled = false;

        loop {
            match reader.next() {
                Ok((consumed, block)) => {
                    stalled = false;
                    match block {
                        PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                            self.link_type = link_type(idb.linktype)?;
                            for opt in &idb.options {
                                if opt.code == OptionCode::IfTsresol {
                                    if let Some(&val) = opt.value.first() {
                                        if_tsresol = if val & 0x80 != 0 {
                                            2u64.pow((val & 0x7f) as u32)
                                        } else {
                                            10u64.pow(val as u32)
                                        };
                                    }
                                }
                            }
                        }
                        PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                            let raw = ((epb.ts_high as u64) << 32) | (epb.ts_low as u64);
                            let secs = (raw / if_tsresol) as i64;
                            let nanos = ((raw % if_tsresol) * 1_000_000_000 / if_tsresol) as u32;
                            let caplen = (epb.caplen as usize).min(epb.data.len());
                            self.push(to_datetime(secs, nanos), &epb.data[..caplen], epb.origlen);
                        }
                        PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                            // Simple packet blocks carry no timestamp.
                            let ts = self.frames.last().map(|f| f.timestamp).unwrap_or_default();
                            let len = (spb.origlen as usize).min(spb.data.len());
                            self.push(ts, &spb.data[..len], spb.origlen);
                        }
                        _ => {}
                    }
                    reader.consume(consumed);
                }
                Err(PcapError::Eof) => break,
                Err(PcapError::Incomplete(_)) => {
                    if stalled {
                        tracing::warn!(frames = self.frames.len(), "capture ends with a truncated block");
                        self.parse_errors += 1;
                        break;
                    }
                    stalled = true;
                    reader
                        .refill()
                        .map_err(|e| anyhow::anyhow!("failed to refill pcapng buffer: {:?}", e))?;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pcapng parse error");
                    self.parse_errors += 1;
                    break;
                }
            }
        }
        Ok(())
    }
}

fn link_type(linktype: Linktype) -> Result<LinkType> {
    match linktype {
        Linktype::ETHERNET => Ok(LinkType::Ethernet),
        Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 | Linktype(12) => Ok(LinkType::RawIp),
        Linktype::LINUX_SLL => Ok(LinkType::LinuxSll),
        Linktype::NULL | Linktype::LOOP => Ok(LinkType::Null),
        other => anyhow::bail!("unsupported link type {}", other.0),
    }
}

fn to_datetime(secs: i64, nanos: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}
