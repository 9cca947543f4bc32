#![no_main]

use libfuzzer_sys::fuzz_target;
use tb_control::{encode_token, parse_command_line, ControlError, Response};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    match parse_command_line(&raw) {
        Ok(command) => {
            assert_eq!(command.raw.len(), command.args.len());
            assert!(!command.args.is_empty());
            for (raw, decoded) in command.raw.iter().zip(&command.args) {
                let reencoded = parse_command_line(&encode_token(decoded));
                if let Ok(again) = reencoded {
                    assert_eq!(again.args[0], *decoded);
                }
                assert!(!raw.chars().any(char::is_whitespace));
            }
        }
        Err(ControlError::Protocol(message)) => {
            let line = Response::ProtocolError(message).to_line();
            assert_eq!(line.split_whitespace().count(), 2);
        }
        Err(other) => panic!("decoder raised a non-protocol error: {other:?}"),
    }
});
