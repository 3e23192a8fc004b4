/// Splits a command line into tokens, honoring single and double quotes.
///
/// This is deliberately simpler than a shell: no variable expansion, no
/// escapes, no globbing. Quotes only group whitespace.
pub fn split_command(s: &str) -> Vec<String> {
	let mut tokens = Vec::new();
	let mut current = String::new();
	let mut in_token = false;
	let mut quote: Option<char> = None;

	for c in s.chars() {
		match quote {
			Some(q) => {
				if c == q {
					quote = None;
				} else {
					current.push(c);
				}
			}
			None => match c {
				'\'' | '"' => {
					quote = Some(c);
					in_token = true;
				}
				c if c.is_whitespace() => {
					if in_token {
						tokens.push(std::mem::take(&mut current));
						in_token = false;
					}
				}
				c => {
					current.push(c);
					in_token = true;
				}
			},
		}
	}
	if in_token {
		tokens.push(current);
	}
	tokens
}
