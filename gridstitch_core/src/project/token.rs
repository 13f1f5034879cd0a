//! Tokenizer for the line-oriented project format.
//!
//! A line is a single prefix character followed by whitespace-separated
//! tokens `k<value>` where keys are short letter runs (`w`, `Ra`, `TrX`) and
//! values are bare numerics or double-quoted strings. A few tool-emitted
//! tokens (`+buf`, `-buf`) carry no key/value split and are kept verbatim.

use anyhow::{Result, bail};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
	Bare(String),
	Quoted(String),
	None,
}

impl TokenValue {
	/// Renders the value the way it appeared, quotes included.
	pub fn raw(&self) -> String {
		match self {
			TokenValue::Bare(s) => s.clone(),
			TokenValue::Quoted(s) => format!("\"{s}\""),
			TokenValue::None => String::new(),
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			TokenValue::Bare(s) | TokenValue::Quoted(s) => Some(s),
			TokenValue::None => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
	pub key: String,
	pub value: TokenValue,
}

impl Token {
	pub fn int(&self) -> Result<i64> {
		match self.value.as_str() {
			Some(s) => Ok(s.parse::<f64>()? as i64),
			None => bail!("token {:?} has no value", self.key),
		}
	}

	pub fn float(&self) -> Result<f64> {
		match self.value.as_str() {
			Some(s) => Ok(s.parse()?),
			None => bail!("token {:?} has no value", self.key),
		}
	}

	pub fn string(&self) -> Result<String> {
		match self.value.as_str() {
			Some(s) => Ok(s.to_string()),
			None => bail!("token {:?} has no value", self.key),
		}
	}
}

/// Splits the remainder of a line (after its prefix character) into tokens.
pub fn tokenize(s: &str) -> Result<Vec<Token>> {
	let mut tokens = Vec::new();
	let mut chars = s.chars().peekable();

	loop {
		while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
			chars.next();
		}
		if chars.peek().is_none() {
			break;
		}

		let mut key = String::new();
		while matches!(chars.peek(), Some(c) if c.is_ascii_alphabetic()) {
			key.push(chars.next().unwrap());
		}

		if key.is_empty() {
			// keyless token such as "+buf" or "-buf"
			let mut raw = String::new();
			while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
				raw.push(chars.next().unwrap());
			}
			tokens.push(Token {
				key: raw,
				value: TokenValue::None,
			});
			continue;
		}

		let value = match chars.peek() {
			Some('"') => {
				chars.next();
				let mut text = String::new();
				loop {
					match chars.next() {
						Some('"') => break,
						Some(c) => text.push(c),
						None => bail!("unterminated quoted string in {s:?}"),
					}
				}
				TokenValue::Quoted(text)
			}
			Some(c) if !c.is_whitespace() => {
				let mut text = String::new();
				while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
					text.push(chars.next().unwrap());
				}
				TokenValue::Bare(text)
			}
			_ => TokenValue::None,
		};
		tokens.push(Token { key, value });
	}
	Ok(tokens)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn keys(s: &str) -> Vec<String> {
		tokenize(s).unwrap().into_iter().map(|t| t.key).collect()
	}

	#[test]
	fn splits_simple_tokens() {
		let tokens = tokenize("f0 w3264 h2448 v51").unwrap();
		assert_eq!(tokens.len(), 4);
		assert_eq!(tokens[1].key, "w");
		assert_eq!(tokens[1].int().unwrap(), 3264);
		assert_eq!(tokens[3].float().unwrap(), 51.0);
	}

	#[test]
	fn multi_letter_keys() {
		assert_eq!(keys("Ra0 Vb0 TrX12"), ["Ra", "Vb", "TrX"]);
	}

	#[test]
	fn quoted_strings_keep_spaces() {
		let tokens = tokenize(r#"n"TIFF_m c:LZW" E0.0"#).unwrap();
		assert_eq!(tokens[0].string().unwrap(), "TIFF_m c:LZW");
		assert_eq!(tokens[1].key, "E");
	}

	#[test]
	fn keyless_tokens_survive() {
		let tokens = tokenize("d-12.5 e3 u10 +buf -buf").unwrap();
		assert_eq!(tokens[0].float().unwrap(), -12.5);
		assert_eq!(tokens[3].key, "+buf");
		assert_eq!(tokens[3].value, TokenValue::None);
		assert_eq!(tokens[4].key, "-buf");
	}

	#[test]
	fn negative_and_float_values() {
		let tokens = tokenize("d-0.000000 e-1706.852324").unwrap();
		assert_eq!(tokens[0].float().unwrap(), 0.0);
		assert_eq!(tokens[1].float().unwrap(), -1706.852324);
	}

	#[test]
	fn unterminated_quote_rejected() {
		assert!(tokenize(r#"n"abc"#).is_err());
	}
}
