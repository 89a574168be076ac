use std::fs;

use bytes::BytesMut;
use chanmux_frame::ChannelProtocol;

use crate::cmd::EncodeArgs;
use crate::exit::{frame_error, io_error, CliResult, SUCCESS};
use crate::output::{print_encoded, OutputFormat};

pub fn run(args: EncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let protocol = ChannelProtocol::from(args.protocol);
    let payload = resolve_payload(&args)?;

    let mut wire = BytesMut::new();
    protocol
        .encode(args.channel, &payload, &mut wire)
        .map_err(|err| frame_error("encode failed", err))?;

    print_encoded(protocol, args.channel, &wire, format);
    Ok(SUCCESS)
}

fn resolve_payload(args: &EncodeArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}
