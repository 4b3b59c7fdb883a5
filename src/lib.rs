use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;
use phf::phf_map;
use rand::Rng;
use rand_distr::StandardNormal;
use regex::Regex;
use thiserror::Error;

pub mod fits;

///dense row-major 2-D image with a fixed shape
#[derive(Clone, PartialEq, Debug)]
pub struct Image {
	rows: usize,
	cols: usize,
	data: Vec<f64>,
}

impl Image {
	///build from a per-pixel function of (row, col)
	pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
		let mut data = Vec::with_capacity(rows * cols);
		for i in 0..rows {
			for j in 0..cols {
				data.push(f(i, j));
			}
		}
		Self {rows, cols, data}
	}

	///constant-valued image
	pub fn filled(rows: usize, cols: usize, v: f64) -> Self {
		Self {rows, cols, data: vec![v; rows * cols]}
	}

	///wrap an existing row-major buffer, len must equal rows*cols
	pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Self {
		assert_eq!(data.len(), rows * cols);
		Self {rows, cols, data}
	}

	pub fn shape(&self) -> (usize, usize) {
		(self.rows, self.cols)
	}

	pub fn data(&self) -> &[f64] {
		&self.data
	}

	///element-wise unary application
	fn map(&self, f: impl Fn(f64) -> f64) -> Self {
		Self {
			rows: self.rows,
			cols: self.cols,
			data: self.data.iter().map(|&v| f(v)).collect(),
		}
	}

	///element-wise binary application, shapes must agree
	fn zip(&self, other: &Self, f: Bin) -> Result<Self, EvalError> {
		if (self.rows, self.cols) != (other.rows, other.cols) {
			return Err(EvalError::ShapeMismatch {
				lr: self.rows, lc: self.cols,
				rr: other.rows, rc: other.cols,
			});
		}
		Ok(Self {
			rows: self.rows,
			cols: self.cols,
			data: self.data.iter().zip(&other.data).map(|(&l, &r)| f(l, r)).collect(),
		})
	}
}

impl std::ops::Index<(usize, usize)> for Image {
	type Output = f64;
	fn index(&self, (i, j): (usize, usize)) -> &f64 {
		&self.data[i * self.cols + j]
	}
}

///basic stack value: scalar or whole image
#[derive(Clone, PartialEq, Debug)]
pub enum Val {
	Num(f64),
	Img(Image),
}
use Val::*;

impl fmt::Display for Val {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Num(n) => write!(f, "{n}"),
			Img(m) => write!(f, "[{}x{} image]", m.rows, m.cols),
		}
	}
}

///everything that can abort an evaluation
#[derive(Debug, Error)]
pub enum EvalError {
	///token is no operator, reference or literal
	#[error("undefined operation: {0}")]
	Undefined(String),
	///an operator popped an empty stack
	#[error("'{0}' wants more operands than the stack holds")]
	Underflow(String),
	///image reference outside the operand list
	#[error("no input image %{0}")]
	NoSuchOperand(usize),
	#[error("shape mismatch: {lr}x{lc} against {rr}x{rc}")]
	ShapeMismatch {lr: usize, lc: usize, rr: usize, rc: usize},
	///stack held != 1 values after the last token
	#[error("stack has improper length {len}: [{contents}]")]
	ImproperStack {len: usize, contents: String},
	///operand source failed to deliver
	#[error("operand source: {0}")]
	Source(String),
}

///delivers input images by 1-based position
pub trait OperandSource {
	///shape (rows, cols) of the first image, the default output shape
	fn shape(&mut self) -> Result<(usize, usize), EvalError>;
	///load the image at 1-based `index`
	fn fetch(&mut self, index: usize) -> Result<Image, EvalError>;
}

type Un = fn(f64) -> f64;
type Bin = fn(f64, f64) -> f64;
type Fill = fn(usize, usize) -> Image;

///unary reading of `+`, lets a lone image pass through (`%1 +`)
fn positive(n: f64) -> f64 {n}
fn negative(n: f64) -> f64 {-n}
fn add(l: f64, r: f64) -> f64 {l + r}
fn sub(l: f64, r: f64) -> f64 {l - r}
fn mul(l: f64, r: f64) -> f64 {l * r}
fn div(l: f64, r: f64) -> f64 {l / r}
fn pow(l: f64, r: f64) -> f64 {l.powf(r)}
///NaN-propagating, unlike f64::max
fn max(l: f64, r: f64) -> f64 {
	if l.is_nan() || r.is_nan() {f64::NAN} else {l.max(r)}
}
///NaN-propagating, unlike f64::min
fn min(l: f64, r: f64) -> f64 {
	if l.is_nan() || r.is_nan() {f64::NAN} else {l.min(r)}
}
fn gt(l: f64, r: f64) -> f64 {(l > r) as u8 as f64}
fn lt(l: f64, r: f64) -> f64 {(l < r) as u8 as f64}
fn eq(l: f64, r: f64) -> f64 {(l == r) as u8 as f64}
fn ge(l: f64, r: f64) -> f64 {(l >= r) as u8 as f64}
fn le(l: f64, r: f64) -> f64 {(l <= r) as u8 as f64}

///uniform [0,1) fill of the target shape
fn uniform(rows: usize, cols: usize) -> Image {
	let mut rng = rand::thread_rng();
	Image::from_fn(rows, cols, |_, _| rng.gen())
}

///standard normal fill of the target shape
fn normal(rows: usize, cols: usize) -> Image {
	let mut rng = rand::thread_rng();
	Image::from_fn(rows, cols, |_, _| rng.sample(StandardNormal))
}

///operators taking no stack operands
static FUNC0: phf::Map<&'static str, Fill> = phf_map! {
	"rand" => uniform,
	"randn" => normal,
};

///unary operators, applied per element on images
static FUNC1: phf::Map<&'static str, Un> = phf_map! {
	"+" => positive,
	"-" => negative,
	"sin" => f64::sin,
	"cos" => f64::cos,
	"exp" => f64::exp,
	"log" => f64::ln,
	"log10" => f64::log10,
	"sqrt" => f64::sqrt,
	"asin" => f64::asin,
	"acos" => f64::acos,
	"atan" => f64::atan,
};

///binary operators, element-wise with scalar broadcasting
static FUNC2: phf::Map<&'static str, Bin> = phf_map! {
	"+" => add,
	"-" => sub,
	"*" => mul,
	"/" => div,
	"**" => pow,
	"^" => pow,
	"pow" => pow,
	"atan2" => f64::atan2,
	"max" => max,
	"fmax" => f64::max,
	"min" => min,
	"fmin" => f64::min,
	">" => gt,
	"<" => lt,
	"==" => eq,
	">=" => ge,
	"<=" => le,
};

lazy_static! {
	///image-reference tokens: `%` followed by a 1-based index
	static ref IMREF: Regex = Regex::new(r"^%([0-9]+)$").unwrap();
}

fn image_ref(token: &str) -> Option<usize> {
	IMREF.captures(token).and_then(|c| c[1].parse().ok())
}

///lift a scalar kernel over one value
fn apply1(f: Un, a: Val) -> Val {
	match a {
		Num(n) => Num(f(n)),
		Img(m) => Img(m.map(f)),
	}
}

///lift a scalar kernel over two values, broadcasting scalars against images
fn apply2(f: Bin, left: Val, right: Val) -> Result<Val, EvalError> {
	Ok(match (left, right) {
		(Num(l), Num(r)) => Num(f(l, r)),
		(Img(l), Num(r)) => Img(l.map(|v| f(v, r))),
		(Num(l), Img(r)) => Img(r.map(|v| f(l, v))),
		(Img(l), Img(r)) => Img(l.zip(&r, f)?),
	})
}

///`?` select as a linear blend: logic*true + (1-logic)*false
///
///a fractional mask blends proportionally instead of hard-selecting
fn blend(logic: Val, when_true: Val, when_false: Val) -> Result<Val, EvalError> {
	let inverse = apply2(sub, Num(1.0), logic.clone())?;
	let t = apply2(mul, logic, when_true)?;
	let f = apply2(mul, inverse, when_false)?;
	apply2(add, t, f)
}

#[inline(always)]
fn pop(stack: &mut Vec<Val>, token: &str) -> Result<Val, EvalError> {
	stack.pop().ok_or_else(|| EvalError::Underflow(token.to_string()))
}

///one evaluation pass: operand cache and lazily built coordinate grids
struct Evaluator<'a> {
	shape: (usize, usize),
	source: Option<&'a mut dyn OperandSource>,
	cache: HashMap<usize, Image>,
	xgrid: Option<Image>,
	ygrid: Option<Image>,
}

///evaluate `command` against loaded images, output shape comes from the first input
pub fn calc(command: &str, source: &mut dyn OperandSource) -> Result<Val, EvalError> {
	let shape = source.shape()?;
	Evaluator {
		shape,
		source: Some(source),
		cache: HashMap::new(),
		xgrid: None,
		ygrid: None,
	}.run(command)
}

///evaluate `command` with no input images, `shape` sizes grids and random fills
pub fn create(command: &str, shape: (usize, usize)) -> Result<Val, EvalError> {
	Evaluator {
		shape,
		source: None,
		cache: HashMap::new(),
		xgrid: None,
		ygrid: None,
	}.run(command)
}

impl Evaluator<'_> {
	fn run(mut self, command: &str) -> Result<Val, EvalError> {
		let mut stack: Vec<Val> = Vec::new();

		for token in command.split_whitespace() {
			/*---------------
				OPERANDS
			---------------*/
			if let Some(index) = image_ref(token) {
				let img = self.fetch(index, token)?;
				stack.push(Img(img));
			}
			else if token == "x" {
				let (rows, cols) = self.shape;
				let g = self.xgrid.get_or_insert_with(|| Image::from_fn(rows, cols, |_, j| (j + 1) as f64));
				stack.push(Img(g.clone()));
			}
			else if token == "y" {
				let (rows, cols) = self.shape;
				let g = self.ygrid.get_or_insert_with(|| Image::from_fn(rows, cols, |i, _| (i + 1) as f64));
				stack.push(Img(g.clone()));
			}
			/*----------------
				OPERATORS
			----------------*/
			else if let (Some(un), Some(bin)) = (FUNC1.get(token), FUNC2.get(token)) {
				//overloaded symbol: binary whenever two operands are available, unary otherwise
				let right = pop(&mut stack, token)?;
				let result = if stack.is_empty() {
					apply1(*un, right)
				}
				else {
					let left = pop(&mut stack, token)?;
					apply2(*bin, left, right)?
				};
				stack.push(result);
			}
			else if let Some(fill) = FUNC0.get(token) {
				let (rows, cols) = self.shape;
				stack.push(Img(fill(rows, cols)));
			}
			else if let Some(f) = FUNC1.get(token) {
				let right = pop(&mut stack, token)?;
				stack.push(apply1(*f, right));
			}
			else if let Some(f) = FUNC2.get(token) {
				let right = pop(&mut stack, token)?;
				let left = pop(&mut stack, token)?;
				stack.push(apply2(*f, left, right)?);
			}
			else if token == "?" {
				let logic = pop(&mut stack, token)?;
				let when_false = pop(&mut stack, token)?;
				let when_true = pop(&mut stack, token)?;
				stack.push(blend(logic, when_true, when_false)?);
			}
			/*---------------
				LITERALS
			---------------*/
			else if let Ok(n) = token.parse::<f64>() {
				stack.push(Num(n));
			}
			else {
				return Err(EvalError::Undefined(token.to_string()));
			}
		}

		if stack.len() != 1 {
			return Err(EvalError::ImproperStack {
				len: stack.len(),
				contents: stack.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "),
			});
		}
		Ok(stack.pop().unwrap())	//guarded by the length check
	}

	///resolve an image reference through the cache, loading on first use
	fn fetch(&mut self, index: usize, token: &str) -> Result<Image, EvalError> {
		let Some(source) = self.source.as_deref_mut() else {
			//create mode knows no image operands
			return Err(EvalError::Undefined(token.to_string()));
		};
		if index == 0 {
			return Err(EvalError::NoSuchOperand(0));
		}
		if let Some(img) = self.cache.get(&index) {
			return Ok(img.clone());
		}
		let img = source.fetch(index)?;
		self.cache.insert(index, img.clone());
		Ok(img)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	///in-memory operand list that counts loads
	struct MemSource {
		images: Vec<Image>,
		fetches: usize,
	}

	impl MemSource {
		fn new(images: Vec<Image>) -> Self {
			Self {images, fetches: 0}
		}
	}

	impl OperandSource for MemSource {
		fn shape(&mut self) -> Result<(usize, usize), EvalError> {
			self.images.first().map(Image::shape)
				.ok_or_else(|| EvalError::Source("no input images".into()))
		}
		fn fetch(&mut self, index: usize) -> Result<Image, EvalError> {
			self.fetches += 1;
			index.checked_sub(1)
				.and_then(|i| self.images.get(i))
				.cloned()
				.ok_or(EvalError::NoSuchOperand(index))
		}
	}

	fn img(rows: usize, cols: usize, data: &[f64]) -> Image {
		Image::from_vec(rows, cols, data.to_vec())
	}

	fn a() -> Image {img(2, 2, &[1., 2., 3., 4.])}
	fn b() -> Image {img(2, 2, &[5., 6., 7., 8.])}

	fn calc_one(command: &str, images: Vec<Image>) -> Result<Val, EvalError> {
		calc(command, &mut MemSource::new(images))
	}

	#[test]
	fn unary_plus_is_identity() {
		assert_eq!(calc_one("%1 +", vec![a()]).unwrap(), Img(a()));
	}

	#[test]
	fn unary_minus_negates() {
		assert_eq!(create("5 -", (1, 1)).unwrap(), Num(-5.0));
		assert_eq!(calc_one("%1 -", vec![a()]).unwrap(), Img(img(2, 2, &[-1., -2., -3., -4.])));
	}

	#[test]
	fn self_subtraction_is_zero() {
		assert_eq!(calc_one("%1 %1 -", vec![a()]).unwrap(), Img(Image::filled(2, 2, 0.0)));
	}

	#[test]
	fn image_addition() {
		assert_eq!(calc_one("%1 %2 +", vec![a(), b()]).unwrap(), Img(img(2, 2, &[6., 8., 10., 12.])));
	}

	#[test]
	fn image_subtraction() {
		assert_eq!(calc_one("%1 %2 -", vec![a(), b()]).unwrap(), Img(Image::filled(2, 2, -4.0)));
	}

	#[test]
	fn square_root_per_element() {
		let Img(m) = calc_one("%1 sqrt", vec![a()]).unwrap() else {panic!("expected an image")};
		for (got, want) in m.data().iter().zip([1.0, std::f64::consts::SQRT_2, 3f64.sqrt(), 2.0]) {
			assert!((got - want).abs() < 1e-12);
		}
	}

	#[test]
	fn addition_and_multiplication_commute() {
		assert_eq!(
			calc_one("%1 %2 +", vec![a(), b()]).unwrap(),
			calc_one("%2 %1 +", vec![a(), b()]).unwrap()
		);
		assert_eq!(
			calc_one("%1 2.5 *", vec![a()]).unwrap(),
			calc_one("2.5 %1 *", vec![a()]).unwrap()
		);
	}

	#[test]
	fn binary_mask_selects_hard() {
		let mask = img(2, 2, &[1., 0., 0., 1.]);
		let got = calc_one("%1 %2 %3 ?", vec![a(), b(), mask]).unwrap();
		assert_eq!(got, Img(img(2, 2, &[1., 6., 7., 4.])));
	}

	#[test]
	fn fractional_mask_blends_proportionally() {
		//0.25*true + 0.75*false, exactly
		let got = calc_one("%1 %2 0.25 ?", vec![a(), b()]).unwrap();
		assert_eq!(got, Img(img(2, 2, &[4., 5., 6., 7.])));
	}

	#[test]
	fn x_grid_counts_columns() {
		assert_eq!(create("x", (2, 3)).unwrap(), Img(img(2, 3, &[1., 2., 3., 1., 2., 3.])));
	}

	#[test]
	fn y_grid_counts_rows() {
		assert_eq!(create("y", (2, 3)).unwrap(), Img(img(2, 3, &[1., 1., 1., 2., 2., 2.])));
	}

	#[test]
	fn grids_resolve_in_calc_mode_too() {
		let got = calc_one("x y +", vec![a()]).unwrap();
		assert_eq!(got, Img(img(2, 2, &[2., 3., 3., 4.])));
	}

	#[test]
	fn leftover_stack_is_an_error() {
		match calc_one("%1 %1", vec![a()]) {
			Err(EvalError::ImproperStack {len: 2, contents}) => {
				assert!(contents.contains("2x2 image"));
			}
			other => panic!("expected ImproperStack, got {other:?}"),
		}
	}

	#[test]
	fn empty_command_is_an_error() {
		assert!(matches!(create("", (2, 2)), Err(EvalError::ImproperStack {len: 0, ..})));
	}

	#[test]
	fn unknown_token_is_fatal() {
		match calc_one("%1 foo", vec![a()]) {
			Err(EvalError::Undefined(t)) => assert_eq!(t, "foo"),
			other => panic!("expected Undefined, got {other:?}"),
		}
	}

	#[test]
	fn operator_on_empty_stack_underflows() {
		match create("sin", (2, 2)) {
			Err(EvalError::Underflow(t)) => assert_eq!(t, "sin"),
			other => panic!("expected Underflow, got {other:?}"),
		}
	}

	#[test]
	fn image_reference_in_create_mode_is_undefined() {
		match create("%1 +", (2, 2)) {
			Err(EvalError::Undefined(t)) => assert_eq!(t, "%1"),
			other => panic!("expected Undefined, got {other:?}"),
		}
	}

	#[test]
	fn reference_zero_is_rejected() {
		assert!(matches!(calc_one("%0 +", vec![a()]), Err(EvalError::NoSuchOperand(0))));
	}

	#[test]
	fn shape_mismatch_is_fatal() {
		let res = calc_one("%1 %2 +", vec![a(), img(1, 3, &[1., 2., 3.])]);
		assert!(matches!(res, Err(EvalError::ShapeMismatch {..})));
	}

	#[test]
	fn each_reference_loads_once() {
		let mut src = MemSource::new(vec![a()]);
		calc("%1 %1 + %1 *", &mut src).unwrap();
		assert_eq!(src.fetches, 1);
	}

	#[test]
	fn power_has_three_spellings() {
		for cmd in ["2 3 **", "2 3 ^", "2 3 pow"] {
			assert_eq!(create(cmd, (1, 1)).unwrap(), Num(8.0));
		}
	}

	#[test]
	fn comparisons_yield_zero_or_one() {
		assert_eq!(calc_one("%1 2.5 >", vec![a()]).unwrap(), Img(img(2, 2, &[0., 0., 1., 1.])));
		assert_eq!(create("2 2 ==", (1, 1)).unwrap(), Num(1.0));
		assert_eq!(create("1 2 >=", (1, 1)).unwrap(), Num(0.0));
		assert_eq!(create("1 2 <=", (1, 1)).unwrap(), Num(1.0));
	}

	#[test]
	fn domain_violations_propagate_as_nan() {
		let Num(n) = create("-1 log", (1, 1)).unwrap() else {panic!("expected a scalar")};
		assert!(n.is_nan());
		let Num(n) = create("2 asin", (1, 1)).unwrap() else {panic!("expected a scalar")};
		assert!(n.is_nan());
		assert_eq!(create("1 0 /", (1, 1)).unwrap(), Num(f64::INFINITY));
		let Num(n) = create("0 0 /", (1, 1)).unwrap() else {panic!("expected a scalar")};
		assert!(n.is_nan());
	}

	#[test]
	fn max_propagates_nan_fmax_ignores_it() {
		let Num(n) = create("nan 1 max", (1, 1)).unwrap() else {panic!("expected a scalar")};
		assert!(n.is_nan());
		let Num(n) = create("nan 1 min", (1, 1)).unwrap() else {panic!("expected a scalar")};
		assert!(n.is_nan());
		assert_eq!(create("nan 1 fmax", (1, 1)).unwrap(), Num(1.0));
		assert_eq!(create("nan 1 fmin", (1, 1)).unwrap(), Num(1.0));
		assert_eq!(create("3 1 max", (1, 1)).unwrap(), Num(3.0));
		assert_eq!(create("3 1 min", (1, 1)).unwrap(), Num(1.0));
	}

	#[test]
	fn random_fills_cover_the_target_shape() {
		let Img(u) = create("rand", (3, 4)).unwrap() else {panic!("expected an image")};
		assert_eq!(u.shape(), (3, 4));
		assert!(u.data().iter().all(|v| (0.0..1.0).contains(v)));
		let Img(n) = create("randn", (3, 4)).unwrap() else {panic!("expected an image")};
		assert_eq!(n.shape(), (3, 4));
	}

	#[test]
	fn atan2_takes_left_as_ordinate() {
		let Num(n) = create("1 0 atan2", (1, 1)).unwrap() else {panic!("expected a scalar")};
		assert!((n - std::f64::consts::FRAC_PI_2).abs() < 1e-15);
	}
}
