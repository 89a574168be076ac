use chanmux_frame::ChannelProtocol;

use crate::cmd::DecodeArgs;
use crate::exit::{frame_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_decoded, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let protocol = ChannelProtocol::from(args.protocol);
    let wire = match (&args.hex, &args.text) {
        (Some(hex), _) => parse_hex(hex)?,
        (None, Some(text)) => text.as_bytes().to_vec(),
        (None, None) => return Err(CliError::new(USAGE, "one of --hex or --text is required")),
    };

    let message = protocol
        .decode(&wire)
        .map_err(|err| frame_error("decode failed", err))?;
    print_decoded(protocol, &message, format);
    Ok(SUCCESS)
}

/// Parse hex digits, ignoring whitespace.
fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return Err(CliError::new(USAGE, "hex input must have an even number of digits"));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).unwrap_or("");
            u8::from_str_radix(text, 16)
                .map_err(|_| CliError::new(USAGE, format!("invalid hex byte: {text:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_with_spaces() {
        assert_eq!(parse_hex("01 68 69").unwrap(), vec![0x01, 0x68, 0x69]);
        assert_eq!(parse_hex("00FF").unwrap(), vec![0x00, 0xff]);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert_eq!(parse_hex("abc").unwrap_err().code, USAGE);
        assert_eq!(parse_hex("zz").unwrap_err().code, USAGE);
    }
}
