//! Host-side rendering of device `printf` output.
//!
//! Kernels do not format anything. Each `printf` call appends a record to the
//! shared ring: the call site's descriptor id followed by the raw argument
//! words. The descriptors themselves travel in the reflection stream as
//! `printf` records:
//!
//! ```text
//! printf,id,3,format,25640a,args,4
//! ```
//!
//! Field 2 is the id, field 4 the hex-encoded format string and field 6 the
//! `;`-separated byte size of each argument. `%s` arguments are ids of
//! descriptors whose format string is the literal text.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::debug;

use crate::error::{Result, RuntimeError};

const WORD: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintfDescriptor {
    pub format: String,
    pub arg_sizes: Vec<u32>,
}

/// Descriptor table of one module.
#[derive(Debug, Clone, Default)]
pub struct PrintfDescriptors {
    map: HashMap<u32, PrintfDescriptor>,
}

fn decode_hex(hex: &str) -> Option<String> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

impl PrintfDescriptors {
    /// Parse the `printf` lines collected by the reflection parser. Lines
    /// that do not decode are skipped.
    pub fn parse(blob: &str) -> Self {
        let mut map = HashMap::new();
        for line in blob.lines() {
            let fields: Vec<&str> = line.split(',').collect();
            let id = fields.get(2).and_then(|f| f.trim().parse::<u32>().ok());
            let format = fields.get(4).and_then(|f| decode_hex(f.trim()));
            let (Some(id), Some(format)) = (id, format) else {
                debug!(line, "skipping malformed printf descriptor");
                continue;
            };
            let arg_sizes = fields
                .get(6)
                .map(|f| {
                    f.split(';')
                        .filter(|s| !s.trim().is_empty())
                        .map(|s| s.trim().parse().unwrap_or(0))
                        .collect()
                })
                .unwrap_or_default();
            map.insert(id, PrintfDescriptor { format, arg_sizes });
        }
        Self { map }
    }

    pub fn get(&self, id: u32) -> Option<&PrintfDescriptor> {
        self.map.get(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + WORD)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Number of bytes of the ring `buffer` that carry data: the counter word
/// plus the payload words it announces, capped at the buffer length.
pub fn used_bytes(buffer: &[u8]) -> usize {
    let words = read_u32(buffer, 0).unwrap_or(0) as usize;
    words
        .saturating_add(1)
        .saturating_mul(WORD)
        .min(buffer.len())
}

/// Render every record in the used part of `buffer`.
pub fn render(buffer: &[u8], descriptors: &PrintfDescriptors) -> Result<String> {
    let end = used_bytes(buffer);
    let mut out = String::new();
    let mut cursor = WORD;
    while cursor + WORD <= end {
        let id = read_u32(buffer, cursor).unwrap_or(0);
        cursor += WORD;
        let desc = descriptors
            .get(id)
            .ok_or_else(|| RuntimeError::Printf(format!("unknown descriptor id {id}")))?;

        let mut args = Vec::with_capacity(desc.arg_sizes.len());
        for &size in &desc.arg_sizes {
            let size = size as usize;
            let stride = size.max(WORD).div_ceil(WORD) * WORD;
            if cursor + stride > end {
                return Err(RuntimeError::Printf(format!(
                    "record for descriptor {id} runs past the used region"
                )));
            }
            args.push(&buffer[cursor..cursor + size]);
            cursor += stride;
        }
        format_record(&mut out, &desc.format, &args, descriptors);
    }
    Ok(out)
}

#[derive(Debug, Default, Clone, Copy)]
struct Directive {
    left: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

fn format_record(out: &mut String, format: &str, args: &[&[u8]], descriptors: &PrintfDescriptors) {
    let mut args = args.iter();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let mut directive = Directive::default();
        while let Some(&f) = chars.peek() {
            match f {
                '-' => directive.left = true,
                '+' => directive.plus = true,
                ' ' => directive.space = true,
                '#' => directive.alt = true,
                '0' => directive.zero = true,
                _ => break,
            }
            chars.next();
        }
        directive.width = take_number(&mut chars);
        if chars.peek() == Some(&'.') {
            chars.next();
            directive.precision = Some(take_number(&mut chars).unwrap_or(0));
        }
        while matches!(chars.peek(), Some('h' | 'l' | 'L' | 'z' | 't' | 'j' | 'q')) {
            chars.next();
        }
        let Some(conv) = chars.next() else {
            out.push('%');
            break;
        };

        let Some(arg) = args.next() else {
            // Conversion without a matching argument is echoed.
            out.push('%');
            out.push(conv);
            continue;
        };
        let text = convert(conv, directive, arg, descriptors);
        pad_into(out, &text, directive, conv);
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut value = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        value = Some(value.unwrap_or(0) * 10 + d as usize);
        chars.next();
    }
    value
}

fn unsigned(arg: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = arg.len().min(8);
    bytes[..n].copy_from_slice(&arg[..n]);
    u64::from_le_bytes(bytes)
}

fn signed(arg: &[u8]) -> i64 {
    let raw = unsigned(arg);
    match arg.len() {
        1 => raw as u8 as i8 as i64,
        2 => raw as u16 as i16 as i64,
        3 | 4 => raw as u32 as i32 as i64,
        _ => raw as i64,
    }
}

fn float(arg: &[u8]) -> f64 {
    let raw = unsigned(arg);
    if arg.len() >= 8 {
        f64::from_bits(raw)
    } else {
        f64::from(f32::from_bits(raw as u32))
    }
}

fn sign_prefix(negative: bool, directive: Directive) -> &'static str {
    if negative {
        "-"
    } else if directive.plus {
        "+"
    } else if directive.space {
        " "
    } else {
        ""
    }
}

fn convert(conv: char, directive: Directive, arg: &[u8], descriptors: &PrintfDescriptors) -> String {
    match conv {
        'd' | 'i' => {
            let v = signed(arg);
            let digits = with_precision(v.unsigned_abs().to_string(), directive.precision);
            format!("{}{}", sign_prefix(v < 0, directive), digits)
        }
        'u' => with_precision(unsigned(arg).to_string(), directive.precision),
        'o' => {
            let digits = with_precision(format!("{:o}", unsigned(arg)), directive.precision);
            if directive.alt && !digits.starts_with('0') {
                format!("0{digits}")
            } else {
                digits
            }
        }
        'x' | 'X' => {
            let v = unsigned(arg);
            let mut digits = with_precision(format!("{v:x}"), directive.precision);
            if directive.alt && v != 0 {
                digits.insert_str(0, "0x");
            }
            if conv == 'X' {
                digits.make_ascii_uppercase();
            }
            digits
        }
        'p' => format!("0x{:x}", unsigned(arg)),
        'c' => char::from(arg.first().copied().unwrap_or(0)).to_string(),
        's' => {
            let id = unsigned(arg) as u32;
            let text = descriptors
                .get(id)
                .map(|d| d.format.as_str())
                .unwrap_or("(null)");
            match directive.precision {
                Some(p) => text.chars().take(p).collect(),
                None => text.to_string(),
            }
        }
        'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'a' | 'A' => format_float(conv, directive, float(arg)),
        other => format!("%{other}"),
    }
}

fn with_precision(digits: String, precision: Option<usize>) -> String {
    match precision {
        Some(0) if digits == "0" => String::new(),
        Some(p) if digits.len() < p => format!("{}{}", "0".repeat(p - digits.len()), digits),
        _ => digits,
    }
}

/// `mantissa e exponent` in C form: at least two exponent digits, signed.
fn c_exponent(rust: &str) -> String {
    match rust.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.unsigned_abs())
        }
        None => rust.to_string(),
    }
}

fn strip_fraction_zeros(s: &str) -> String {
    let (body, exp) = match s.find('e') {
        Some(i) => s.split_at(i),
        None => (s, ""),
    };
    let body = if body.contains('.') {
        body.trim_end_matches('0').trim_end_matches('.')
    } else {
        body
    };
    format!("{body}{exp}")
}

fn hex_float(v: f64, precision: Option<usize>) -> String {
    if v == 0.0 {
        return "0x0p+0".to_string();
    }
    let bits = v.to_bits();
    let raw_exp = ((bits >> 52) & 0x7ff) as i64;
    let fraction = bits & ((1u64 << 52) - 1);
    let (lead, exp) = if raw_exp == 0 {
        (0, -1022)
    } else {
        (1, raw_exp - 1023)
    };
    let mut digits = format!("{fraction:013x}");
    match precision {
        Some(p) => digits.truncate(p),
        None => {
            let trimmed = digits.trim_end_matches('0').len();
            digits.truncate(trimmed);
        }
    }
    let dot = if digits.is_empty() { "" } else { "." };
    format!("0x{lead}{dot}{digits}p{exp:+}")
}

fn format_float(conv: char, directive: Directive, v: f64) -> String {
    let upper = conv.is_ascii_uppercase();
    let sign = sign_prefix(v.is_sign_negative() && !v.is_nan(), directive);
    let body = if v.is_nan() {
        "nan".to_string()
    } else if v.is_infinite() {
        "inf".to_string()
    } else {
        let a = v.abs();
        let precision = directive.precision.unwrap_or(6);
        match conv.to_ascii_lowercase() {
            'f' => format!("{a:.precision$}"),
            'e' => c_exponent(&format!("{a:.precision$e}")),
            'a' => hex_float(a, directive.precision),
            _ => {
                let p = precision.max(1);
                let exp = if a == 0.0 {
                    0
                } else {
                    // Exponent after rounding to p significant digits.
                    let rounded = format!("{a:.prec$e}", prec = p - 1);
                    rounded
                        .split_once('e')
                        .and_then(|(_, e)| e.parse::<i64>().ok())
                        .unwrap_or(0)
                };
                let s = if exp < -4 || exp >= p as i64 {
                    c_exponent(&format!("{a:.prec$e}", prec = p - 1))
                } else {
                    let prec = (p as i64 - 1 - exp).max(0) as usize;
                    format!("{a:.prec$}")
                };
                if directive.alt {
                    s
                } else {
                    strip_fraction_zeros(&s)
                }
            }
        }
    };
    let text = format!("{sign}{body}");
    if upper {
        text.to_ascii_uppercase()
    } else {
        text
    }
}

fn pad_into(out: &mut String, text: &str, directive: Directive, conv: char) {
    let width = directive.width.unwrap_or(0);
    let len = text.chars().count();
    if len >= width {
        out.push_str(text);
        return;
    }
    let fill = width - len;
    let numeric = matches!(
        conv,
        'd' | 'i' | 'u' | 'o' | 'x' | 'X' | 'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'a' | 'A'
    );
    let integer_with_precision = matches!(conv, 'd' | 'i' | 'u' | 'o' | 'x' | 'X') && directive.precision.is_some();
    let finite = !text.contains("nan") && !text.contains("inf") && !text.contains("NAN") && !text.contains("INF");

    if directive.left {
        let _ = write!(out, "{text}{}", " ".repeat(fill));
    } else if directive.zero && numeric && finite && !integer_with_precision {
        // Zeros go between the sign or radix prefix and the digits.
        let prefix_len = text
            .char_indices()
            .take_while(|&(i, c)| matches!(c, '-' | '+' | ' ') && i == 0)
            .count();
        let (sign, rest) = text.split_at(prefix_len);
        let (radix, digits) = if rest.starts_with("0x") || rest.starts_with("0X") {
            rest.split_at(2)
        } else {
            ("", rest)
        };
        let _ = write!(out, "{sign}{radix}{}{digits}", "0".repeat(fill));
    } else {
        let _ = write!(out, "{}{text}", " ".repeat(fill));
    }
}
