use std::path::PathBuf;
use std::process::exit;

use imcalc::fits::{self, Bitpix, FileSource, Header};
use imcalc::{Image, Val};

const HELPMSG: &str = r#"imcalc - FITS image calculator, command strings are reverse polish

Usage:
	imcalc [OPTIONS] 'COMMAND' [FILE1 FILE2 ...]

The command string is split on whitespace. %1, %2, ... push the input
files by position, x/y push 1-based pixel coordinate grids, rand/randn
push random images, anything numeric pushes a scalar, and everything
else must be an operator. Exactly one value must remain on the stack;
it is written as a FITS image to stdout unless -o is given.

Options:
--create|-c ROWS COLS
	Create mode: no input files, the output size is given explicitly.
--bitpix|-p CODE
	BITPIX of the output: 8, 16, 32, -32 or -64 (default -64).
--out|-o FILE
	Write the result to FILE instead of stdout.
--help|-h
	Ignores all other options and prints this help message."#;

fn fail(msg: &str) -> ! {
	eprintln!("! {msg}");
	exit(1)
}

fn main() {
	let mut args = std::env::args().skip(1);
	let mut naxes: Option<(usize, usize)> = None;
	let mut bitpix = Bitpix::F64;
	let mut out: Option<PathBuf> = None;
	let mut rest: Vec<String> = Vec::new();

	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--help" | "-h" => {
				println!("{HELPMSG}");
				exit(0);
			}
			"--create" | "-c" => {
				let (Some(r), Some(c)) = (args.next(), args.next()) else {
					fail("-c needs two size arguments")
				};
				match (r.parse(), c.parse()) {
					(Ok(rows), Ok(cols)) => {naxes = Some((rows, cols));}
					_ => {fail("-c sizes must be nonnegative integers")}
				}
			}
			"--bitpix" | "-p" => {
				let Some(v) = args.next() else {
					fail("-p needs a bitpix argument")
				};
				match v.parse::<i64>().ok().and_then(Bitpix::from_code) {
					Some(b) => {bitpix = b;}
					//unknown codes are a diagnostic, the output stays 64-bit float
					None => {eprintln!("! Unrecognized bitpix \"{v}\", writing -64");}
				}
			}
			"--out" | "-o" => {
				let Some(v) = args.next() else {
					fail("-o needs a file argument")
				};
				out = Some(PathBuf::from(v));
			}
			s if s.starts_with("--") => {
				fail(&format!("Unrecognized option: {s}, use -h for help"))
			}
			_ => {rest.push(arg);}
		}
	}

	if rest.is_empty() {
		fail("No command string given, use -h for help")
	}
	let command = rest.remove(0);
	let files: Vec<PathBuf> = rest.drain(..).map(PathBuf::from).collect();

	eprintln!("Command: {:?}", command.split_whitespace().collect::<Vec<_>>());

	let (result, mut header, shape) = match naxes {
		Some(shape) => {
			if !files.is_empty() {
				eprintln!("! Create mode ignores input files");
			}
			match imcalc::create(&command, shape) {
				Ok(v) => (v, Header::new(), shape),
				Err(e) => {fail(&e.to_string())}
			}
		}
		None => {
			eprintln!("Files: {files:?}");
			let mut source = FileSource::new(files.clone());
			let val = match imcalc::calc(&command, &mut source) {
				Ok(v) => v,
				Err(e) => {fail(&e.to_string())}
			};
			//carry the first input's header through to the output
			match fits::read_header(&files[0]) {
				Ok((header, shape)) => (val, header, shape),
				Err(e) => {fail(&e.to_string())}
			}
		}
	};

	header.add_history(&format!("imcalc '{command}'"));

	let image = match result {
		Val::Img(m) => m,
		//a scalar result becomes a constant image of the output shape
		Val::Num(n) => Image::filled(shape.0, shape.1, n),
	};

	let wrote = match out {
		Some(path) => fits::write(&path, &image, &header, bitpix),
		None => fits::write_to(&mut std::io::stdout().lock(), &image, &header, bitpix),
	};
	if let Err(e) = wrote {
		fail(&format!("Unable to write output: {e}"))
	}
}
