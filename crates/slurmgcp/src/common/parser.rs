use anyhow::anyhow;
use chumsky::Parser;
use chumsky::error::Simple;
use chumsky::primitive::end;
use colored::Color;

pub type ParseError = Simple<char>;

// Parsing infrastructure
pub trait CharParser<T>: Parser<char, T, Error = Simple<char>> + Sized {
    fn parse_text(&self, input: &str) -> anyhow::Result<T> {
        self.parse(input)
            .map_err(|errors| anyhow!("{}", format_errors_cli(input, errors)))
    }
}
impl<T, P> CharParser<T> for P where P: Parser<char, T, Error = Simple<char>> {}

#[cfg(not(test))]
fn color_string<S: AsRef<str>>(string: S, color: Color) -> colored::ColoredString {
    use colored::Colorize;
    string.as_ref().color(color)
}

#[cfg(test)]
fn color_string<S: AsRef<str>>(string: S, _color: Color) -> String {
    string.as_ref().to_string()
}

/// Describes the first parse error and points at its position in `input`.
pub fn format_errors_cli(input: &str, mut errors: Vec<Simple<char>>) -> String {
    use chumsky::Span;
    use chumsky::error::SimpleReason;

    const ERROR_COLOR: Color = Color::Red;

    errors.truncate(1);
    let Some(error) = errors.pop() else {
        return "Cannot parse the input".to_string();
    };

    let problem = match (error.reason(), error.found()) {
        (SimpleReason::Custom(message), _) => message.clone(),
        (_, Some(c)) => format!("unexpected `{c}`"),
        (_, None) => "unexpected end of input".to_string(),
    };
    let mut message = match error.label() {
        Some(label) => format!("Invalid {}: {problem}", color_string(label, Color::Yellow)),
        None => {
            let mut chars = problem.chars();
            chars
                .next()
                .map(|first| first.to_uppercase().chain(chars).collect())
                .unwrap_or_default()
        }
    };

    let mut expected: Vec<String> = error
        .expected()
        .map(|expected| match expected {
            Some(c) => format!("`{c}`"),
            None => "end of input".to_string(),
        })
        .collect();
    expected.sort_unstable();
    expected.dedup();
    if !expected.is_empty() && !matches!(error.reason(), SimpleReason::Custom(_)) {
        let expected: Vec<String> = expected
            .into_iter()
            .map(|e| color_string(e, Color::Blue).to_string())
            .collect();
        message.push_str(&format!(", expected {}", expected.join(" or ")));
    }

    if input.is_empty() {
        return format!("{message}\n  (empty input)");
    }
    let span = error.span();
    let before: String = input.chars().take(span.start()).collect();
    let marked: String = input
        .chars()
        .skip(span.start())
        .take(span.end().saturating_sub(span.start()))
        .collect();
    let after: String = input.chars().skip(span.end()).collect();
    format!(
        "{message}\n  {before}{}{after}\n  {}{}",
        color_string(marked, ERROR_COLOR),
        " ".repeat(span.start()),
        color_string("^", ERROR_COLOR)
    )
}

/// Decimal digits, leading zeros are kept.
pub fn parse_digits() -> impl CharParser<String> {
    chumsky::primitive::filter(|c: &char| c.is_ascii_digit())
        .repeated()
        .at_least(1)
        .collect::<String>()
        .labelled("number")
}

/// Return a parser that will fail if there is any input following the text parsed by the
/// provided parser.
pub fn all_consuming<T>(parser: impl CharParser<T>) -> impl CharParser<T> {
    parser.then_ignore(end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::expect_parser_error;
    use chumsky::primitive::just;

    #[test]
    fn digits_keep_padding() {
        assert_eq!(parse_digits().parse_text("007").unwrap(), "007");
        assert_eq!(parse_digits().parse_text("12").unwrap(), "12");
    }

    #[test]
    fn digits_empty() {
        insta::assert_snapshot!(expect_parser_error(parse_digits(), ""), @r###"
        Invalid number: unexpected end of input
          (empty input)
        "###);
    }

    #[test]
    fn trailing_input_is_rejected() {
        assert!(all_consuming(parse_digits()).parse_text("12x").is_err());
        assert_eq!(all_consuming(parse_digits()).parse_text("12").unwrap(), "12");
    }

    #[test]
    fn delimited_values() {
        let parser = just('x')
            .separated_by(just(','))
            .delimited_by(just('['), just(']'));

        insta::assert_snapshot!(expect_parser_error(parser, "[x,x"), @r###"
        Unexpected end of input, expected `,` or `]`
          [x,x
              ^
        "###);
    }
}
