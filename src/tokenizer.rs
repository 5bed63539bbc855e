/// Split one physical line into trimmed fields.
///
/// Commas separate fields unless they sit inside a quoted span. A doubled quote inside a quoted
/// span yields one literal quote. Unbalanced quotes never fail: whatever quote state is reached
/// at end of line is kept and the pending field is still emitted.
pub fn tokenize_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    fields.push(current.trim().to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::tokenize_line;

    #[test]
    fn quoted_commas_and_doubled_quotes() {
        assert_eq!(tokenize_line(r#"a,"b,c","d""e""#), vec!["a", "b,c", "d\"e"]);
    }

    #[test]
    fn trims_each_field_and_keeps_empty_ones() {
        assert_eq!(tokenize_line("  x , ,y\r"), vec!["x", "", "y"]);
        assert_eq!(tokenize_line(""), vec![""]);
        assert_eq!(tokenize_line(",,"), vec!["", "", ""]);
    }

    #[test]
    fn unbalanced_quote_consumes_rest_of_line() {
        assert_eq!(tokenize_line(r#"a,"b,c"#), vec!["a", "b,c"]);
    }

    #[test]
    fn quote_outside_a_quoted_span_toggles() {
        // `""` at the start of a field opens then closes an empty quoted span
        assert_eq!(tokenize_line(r#""",x"#), vec!["", "x"]);
        assert_eq!(tokenize_line(r#"ab"c,d"e"#), vec!["abc,de"]);
    }
}
