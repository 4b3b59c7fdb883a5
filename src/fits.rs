//! Pure-Rust FITS primary-HDU reader/writer, the container glue around the
//! evaluator. Covers 2-D images in BITPIX 8/16/32/-32/-64 with BSCALE/BZERO
//! applied on read and HISTORY audit cards appended on write.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{EvalError, Image, OperandSource};

///FITS files are sequences of blocks this long
pub const BLOCK: usize = 2880;
///header cards are fixed-width lines, 36 per block
const CARD: usize = 80;

///output pixel representation, keyed by FITS BITPIX code
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Bitpix {
	U8,
	I16,
	I32,
	F32,
	F64,
}

impl Bitpix {
	///the BITPIX header value
	pub fn code(self) -> i64 {
		match self {
			Self::U8 => 8,
			Self::I16 => 16,
			Self::I32 => 32,
			Self::F32 => -32,
			Self::F64 => -64,
		}
	}

	pub fn from_code(code: i64) -> Option<Self> {
		match code {
			8 => Some(Self::U8),
			16 => Some(Self::I16),
			32 => Some(Self::I32),
			-32 => Some(Self::F32),
			-64 => Some(Self::F64),
			_ => None,
		}
	}

	///bytes per pixel
	fn width(self) -> usize {
		match self {
			Self::U8 => 1,
			Self::I16 => 2,
			Self::I32 | Self::F32 => 4,
			Self::F64 => 8,
		}
	}
}

///malformed container contents
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("not a FITS file (no SIMPLE = T)")]
	NotFits,
	#[error("header ends without an END card")]
	UnterminatedHeader,
	#[error("missing or invalid {0} in header")]
	BadKey(&'static str),
	#[error("only 2-D images are supported (NAXIS = {0})")]
	NotTwoDee(i64),
	#[error("unsupported BITPIX {0}")]
	BadBitpix(i64),
	#[error("data block is truncated")]
	Truncated,
}

///container I/O failures, with the file they happened on
#[derive(Debug, Error)]
pub enum FitsError {
	#[error("{path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
	#[error("{path}: {source}")]
	Decode {
		path: PathBuf,
		#[source]
		source: DecodeError,
	},
}

impl From<FitsError> for EvalError {
	fn from(e: FitsError) -> Self {
		EvalError::Source(e.to_string())
	}
}

///carried header cards of a primary HDU
///
///structural cards (SIMPLE, BITPIX, NAXIS*, EXTEND, BSCALE/BZERO) are
///regenerated on write and never stored here
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Header {
	cards: Vec<String>,
}

impl Header {
	pub fn new() -> Self {
		Self::default()
	}

	///append an audit entry, wrapped over as many HISTORY cards as needed
	pub fn add_history(&mut self, text: &str) {
		let chars: Vec<char> = text.chars().collect();
		if chars.is_empty() {
			self.cards.push("HISTORY".into());
			return;
		}
		for chunk in chars.chunks(CARD - 8) {
			self.cards.push(format!("HISTORY {}", chunk.iter().collect::<String>()));
		}
	}

	pub fn cards(&self) -> &[String] {
		&self.cards
	}
}

///keyword of a raw card (columns 1-8)
fn keyword(card: &str) -> &str {
	card.get(..8).unwrap_or(card).trim_end()
}

///value field of a `KEY     = value / comment` card
fn value(card: &str) -> Option<&str> {
	if card.as_bytes().get(8..10) == Some(&b"= "[..]) {
		let v = &card[10..];
		Some(v.split_once('/').map_or(v, |(v, _)| v).trim())
	}
	else {
		None
	}
}

fn lookup_i64(cards: &[String], key: &str) -> Option<i64> {
	cards.iter().find(|c| keyword(c.as_str()) == key).and_then(|c| value(c)).and_then(|v| v.parse().ok())
}

fn lookup_f64(cards: &[String], key: &str) -> Option<f64> {
	cards.iter().find(|c| keyword(c.as_str()) == key).and_then(|c| value(c)).and_then(|v| v.parse().ok())
}

///geometry and scaling of the data unit, gathered from the header
struct Geometry {
	rows: usize,
	cols: usize,
	bitpix: Bitpix,
	bscale: f64,
	bzero: f64,
	data_start: usize,
}

const STRUCTURAL: [&str; 8] = ["SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "EXTEND", "BSCALE", "BZERO"];

fn decode_header(bytes: &[u8]) -> Result<(Header, Geometry), DecodeError> {
	let mut cards: Vec<String> = Vec::new();
	let mut pos = 0;
	let mut terminated = false;
	while !terminated {
		if pos + BLOCK > bytes.len() {
			return Err(DecodeError::UnterminatedHeader);
		}
		for i in 0..BLOCK / CARD {
			let raw = &bytes[pos + i * CARD..pos + (i + 1) * CARD];
			let card = String::from_utf8_lossy(raw).trim_end().to_string();
			if keyword(&card) == "END" {
				terminated = true;
				break;	//rest of the block is padding
			}
			if !card.is_empty() {
				cards.push(card);
			}
		}
		pos += BLOCK;
	}

	let simple = cards.first().and_then(|c| if keyword(c) == "SIMPLE" {value(c)} else {None});
	if simple != Some("T") {
		return Err(DecodeError::NotFits);
	}

	let bp = lookup_i64(&cards, "BITPIX").ok_or(DecodeError::BadKey("BITPIX"))?;
	let bitpix = Bitpix::from_code(bp).ok_or(DecodeError::BadBitpix(bp))?;
	let naxis = lookup_i64(&cards, "NAXIS").ok_or(DecodeError::BadKey("NAXIS"))?;
	if naxis != 2 {
		return Err(DecodeError::NotTwoDee(naxis));
	}
	let cols = lookup_i64(&cards, "NAXIS1")
		.and_then(|n| usize::try_from(n).ok())
		.ok_or(DecodeError::BadKey("NAXIS1"))?;
	let rows = lookup_i64(&cards, "NAXIS2")
		.and_then(|n| usize::try_from(n).ok())
		.ok_or(DecodeError::BadKey("NAXIS2"))?;
	let bscale = lookup_f64(&cards, "BSCALE").unwrap_or(1.0);
	let bzero = lookup_f64(&cards, "BZERO").unwrap_or(0.0);

	let carried = cards.into_iter().filter(|c| !STRUCTURAL.contains(&keyword(c))).collect();
	Ok((
		Header {cards: carried},
		Geometry {rows, cols, bitpix, bscale, bzero, data_start: pos},
	))
}

///decode a primary HDU from raw bytes
pub fn decode(bytes: &[u8]) -> Result<(Image, Header), DecodeError> {
	let (header, geo) = decode_header(bytes)?;
	let count = geo.rows * geo.cols;
	let end = geo.data_start + count * geo.bitpix.width();
	if bytes.len() < end {
		return Err(DecodeError::Truncated);
	}
	let raw = &bytes[geo.data_start..end];

	let mut data: Vec<f64> = Vec::with_capacity(count);
	match geo.bitpix {
		Bitpix::U8 => data.extend(raw.iter().map(|&b| b as f64)),
		Bitpix::I16 => data.extend(raw.chunks_exact(2).map(|c| i16::from_be_bytes([c[0], c[1]]) as f64)),
		Bitpix::I32 => data.extend(raw.chunks_exact(4).map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64)),
		Bitpix::F32 => data.extend(raw.chunks_exact(4).map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64)),
		Bitpix::F64 => data.extend(raw.chunks_exact(8).map(|c| {
			f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
		})),
	}
	if geo.bscale != 1.0 || geo.bzero != 0.0 {
		for v in &mut data {
			*v = geo.bscale * *v + geo.bzero;
		}
	}
	Ok((Image::from_vec(geo.rows, geo.cols, data), header))
}

///format one `KEY = value` card, value right-justified to column 30
fn card(key: &str, val: &str) -> String {
	format!("{key:<8}= {val:>20}")
}

///encode an image as a complete primary HDU
pub fn encode(img: &Image, header: &Header, bitpix: Bitpix) -> Vec<u8> {
	let (rows, cols) = img.shape();
	let mut cards = vec![
		card("SIMPLE", "T"),
		card("BITPIX", &bitpix.code().to_string()),
		card("NAXIS", "2"),
		card("NAXIS1", &cols.to_string()),
		card("NAXIS2", &rows.to_string()),
	];
	cards.extend(header.cards.iter().cloned());
	cards.push("END".into());

	let mut out = Vec::new();
	for c in &cards {
		let mut line = c.clone().into_bytes();
		line.truncate(CARD);
		line.resize(CARD, b' ');
		out.extend_from_slice(&line);
	}
	pad(&mut out, b' ');

	for &v in img.data() {
		match bitpix {
			Bitpix::U8 => out.push(v as u8),
			Bitpix::I16 => out.extend_from_slice(&(v as i16).to_be_bytes()),
			Bitpix::I32 => out.extend_from_slice(&(v as i32).to_be_bytes()),
			Bitpix::F32 => out.extend_from_slice(&(v as f32).to_be_bytes()),
			Bitpix::F64 => out.extend_from_slice(&v.to_be_bytes()),
		}
	}
	pad(&mut out, 0);
	out
}

///pad to the next block boundary
fn pad(out: &mut Vec<u8>, fill: u8) {
	while out.len() % BLOCK != 0 {
		out.push(fill);
	}
}

///read a primary HDU image and its carried header
pub fn read(path: &Path) -> Result<(Image, Header), FitsError> {
	let bytes = fs::read(path).map_err(|e| FitsError::Io {path: path.into(), source: e})?;
	decode(&bytes).map_err(|e| FitsError::Decode {path: path.into(), source: e})
}

///header-only read, for shape probing and header carry-through
pub fn read_header(path: &Path) -> Result<(Header, (usize, usize)), FitsError> {
	let bytes = fs::read(path).map_err(|e| FitsError::Io {path: path.into(), source: e})?;
	let (header, geo) = decode_header(&bytes).map_err(|e| FitsError::Decode {path: path.into(), source: e})?;
	Ok((header, (geo.rows, geo.cols)))
}

///write a complete FITS file at `path`
pub fn write(path: &Path, img: &Image, header: &Header, bitpix: Bitpix) -> io::Result<()> {
	fs::write(path, encode(img, header, bitpix))
}

///write a complete FITS file to any byte sink
pub fn write_to(w: &mut dyn Write, img: &Image, header: &Header, bitpix: Bitpix) -> io::Result<()> {
	w.write_all(&encode(img, header, bitpix))
}

///resolves `%N` references against FITS files named on the command line
pub struct FileSource {
	paths: Vec<PathBuf>,
}

impl FileSource {
	pub fn new(paths: Vec<PathBuf>) -> Self {
		Self {paths}
	}
}

impl OperandSource for FileSource {
	fn shape(&mut self) -> Result<(usize, usize), EvalError> {
		let path = self.paths.first()
			.ok_or_else(|| EvalError::Source("no input images given".into()))?;
		let (_, shape) = read_header(path)?;
		Ok(shape)
	}

	fn fetch(&mut self, index: usize) -> Result<Image, EvalError> {
		let path = index.checked_sub(1)
			.and_then(|i| self.paths.get(i))
			.ok_or(EvalError::NoSuchOperand(index))?;
		let (img, _) = read(path)?;
		Ok(img)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> Image {
		Image::from_vec(2, 3, vec![0.0, 1.5, -2.0, 3.25, 100.0, -7.5])
	}

	#[test]
	fn round_trip_preserves_data_and_history() {
		let mut header = Header::new();
		header.add_history("imcalc '%1 %2 +'");
		let bytes = encode(&sample(), &header, Bitpix::F64);
		assert_eq!(bytes.len() % BLOCK, 0);
		let (img, carried) = decode(&bytes).unwrap();
		assert_eq!(img, sample());
		assert!(carried.cards().iter().any(|c| c.starts_with("HISTORY imcalc")));
	}

	#[test]
	fn integer_output_truncates_toward_zero() {
		let bytes = encode(&sample(), &Header::new(), Bitpix::I16);
		let (img, _) = decode(&bytes).unwrap();
		assert_eq!(img.data(), &[0.0, 1.0, -2.0, 3.0, 100.0, -7.0][..]);
	}

	#[test]
	fn scaling_cards_are_honored_on_read() {
		let raw = Image::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]);
		let header = Header {cards: vec![card("BSCALE", "2"), card("BZERO", "10")]};
		let (img, carried) = decode(&encode(&raw, &header, Bitpix::I16)).unwrap();
		assert_eq!(img.data(), &[12.0, 14.0, 16.0, 18.0][..]);
		//scaling cards are structural and must not be carried further
		assert!(carried.cards().is_empty());
	}

	#[test]
	fn float32_narrows_but_round_trips() {
		let bytes = encode(&sample(), &Header::new(), Bitpix::F32);
		let (img, _) = decode(&bytes).unwrap();
		assert_eq!(img, sample());	//all sample values are exact in f32
	}

	#[test]
	fn truncated_data_is_reported() {
		let mut bytes = encode(&sample(), &Header::new(), Bitpix::F64);
		bytes.truncate(BLOCK + 8);
		assert!(matches!(decode(&bytes), Err(DecodeError::Truncated)));
	}

	#[test]
	fn non_fits_bytes_are_rejected() {
		let mut bytes = encode(&sample(), &Header::new(), Bitpix::U8);
		bytes[..6].copy_from_slice(b"FOOBAR");
		assert!(matches!(decode(&bytes), Err(DecodeError::NotFits)));
		assert!(matches!(decode(b"hello"), Err(DecodeError::UnterminatedHeader)));
	}

	#[test]
	fn cards_are_eighty_columns() {
		let bytes = encode(&sample(), &Header::new(), Bitpix::F32);
		assert_eq!(&bytes[..10], &b"SIMPLE  = "[..]);
		assert_eq!(bytes[29], b'T');
		assert_eq!(&bytes[CARD..CARD + 8], &b"BITPIX  "[..]);
	}

	#[test]
	fn long_history_wraps_over_cards() {
		let mut h = Header::new();
		h.add_history(&"x".repeat(100));
		assert_eq!(h.cards().len(), 2);
		assert!(h.cards().iter().all(|c| c.len() <= 80));
	}
}
