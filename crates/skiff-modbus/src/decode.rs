use skiff_domain::{DataPoint, DataType, Endianness, QualityCode, SampleValue};

/// Decode a coil/discrete-input read: the first bit is the value.
pub fn decode_bits(bits: &[bool]) -> SampleValue {
    SampleValue::Bool(bits.first().copied().unwrap_or(false))
}

/// Decode a register read per the data point's type, endianness and scaling.
///
/// Word concatenation uses the device's endianness: `big` keeps register
/// order, `little` swaps it (the common Modbus word-swap convention).
/// Bytes within a register are always big-endian per the Modbus spec.
pub fn decode_registers(dp: &DataPoint, words: &[u16]) -> Option<SampleValue> {
    match dp.data_type {
        DataType::Bool => words.first().map(|w| SampleValue::Bool(*w != 0)),
        DataType::Int16 => words.first().map(|w| scaled(dp, *w as i16 as f64)),
        DataType::Uint16 => words.first().map(|w| scaled(dp, *w as f64)),
        DataType::Int32 => word_pair(dp, words).map(|raw| scaled(dp, raw as i32 as f64)),
        DataType::Uint32 => word_pair(dp, words).map(|raw| scaled(dp, raw as f64)),
        DataType::Float32 => {
            word_pair(dp, words).map(|raw| scaled(dp, f32::from_bits(raw) as f64))
        }
        DataType::String => {
            let mut bytes = Vec::with_capacity(words.len() * 2);
            for w in words {
                bytes.extend_from_slice(&w.to_be_bytes());
            }
            let text = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\0')
                .to_string();
            Some(SampleValue::Text(text))
        }
    }
}

fn word_pair(dp: &DataPoint, words: &[u16]) -> Option<u32> {
    let (first, second) = match words {
        [a, b, ..] => (*a, *b),
        _ => return None,
    };
    Some(match dp.endianness {
        Endianness::Big => ((first as u32) << 16) | second as u32,
        Endianness::Little => ((second as u32) << 16) | first as u32,
    })
}

/// Apply `scale*raw + offset`. Identity-scaled integer types stay integers.
fn scaled(dp: &DataPoint, raw: f64) -> SampleValue {
    let identity = dp.scale == 1.0 && dp.offset == 0.0;
    let integral = matches!(
        dp.data_type,
        DataType::Int16 | DataType::Uint16 | DataType::Int32 | DataType::Uint32
    );
    if identity && integral {
        SampleValue::Integer(raw as i64)
    } else {
        SampleValue::Float(dp.scale * raw + dp.offset)
    }
}

/// Map a transport-level I/O failure onto a sample quality code.
pub fn classify_io_error(e: &std::io::Error) -> QualityCode {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => QualityCode::Timeout,
        ErrorKind::ConnectionRefused => QualityCode::ConnectionRefused,
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => QualityCode::HostUnreachable,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => QualityCode::ConnectionReset,
        ErrorKind::NotFound => QualityCode::PortNotFound,
        _ => QualityCode::ReadError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_domain::FunctionCode;

    fn point(data_type: DataType, count: u16, endianness: Endianness) -> DataPoint {
        DataPoint {
            name: "p".into(),
            address: 0,
            function_code: FunctionCode::ReadHoldingRegisters,
            data_type,
            count,
            endianness,
            scale: 1.0,
            offset: 0.0,
            unit: None,
        }
    }

    #[test]
    fn float32_big_endian_reference_value() {
        // 0x42 0xF6 0xE6 0x66 == 123.45f32
        let dp = point(DataType::Float32, 2, Endianness::Big);
        let value = decode_registers(&dp, &[0x42F6, 0xE666]).unwrap();
        match value {
            SampleValue::Float(f) => assert!((f - 123.45).abs() < 1e-4, "got {}", f),
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn float32_scaled() {
        let mut dp = point(DataType::Float32, 2, Endianness::Big);
        dp.scale = 0.1;
        let value = decode_registers(&dp, &[0x42F6, 0xE666]).unwrap();
        match value {
            SampleValue::Float(f) => assert!((f - 12.345).abs() < 1e-4, "got {}", f),
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn float32_little_endian_swaps_words() {
        let big = point(DataType::Float32, 2, Endianness::Big);
        let little = point(DataType::Float32, 2, Endianness::Little);
        assert_eq!(
            decode_registers(&big, &[0x42F6, 0xE666]),
            decode_registers(&little, &[0xE666, 0x42F6])
        );
    }

    #[test]
    fn int16_is_sign_extended() {
        let dp = point(DataType::Int16, 1, Endianness::Big);
        assert_eq!(decode_registers(&dp, &[0xFFFE]), Some(SampleValue::Integer(-2)));
    }

    #[test]
    fn uint32_big_endian() {
        let dp = point(DataType::Uint32, 2, Endianness::Big);
        assert_eq!(
            decode_registers(&dp, &[0x0001, 0x0000]),
            Some(SampleValue::Integer(65_536))
        );
    }

    #[test]
    fn scaled_integer_becomes_float() {
        let mut dp = point(DataType::Uint16, 1, Endianness::Big);
        dp.scale = 0.5;
        dp.offset = 1.0;
        assert_eq!(decode_registers(&dp, &[10]), Some(SampleValue::Float(6.0)));
    }

    #[test]
    fn string_is_nul_trimmed() {
        let dp = point(DataType::String, 4, Endianness::Big);
        // "PUMP" + two NUL-padded registers
        let words = [0x5055, 0x4D50, 0x0000, 0x0000];
        assert_eq!(
            decode_registers(&dp, &words),
            Some(SampleValue::Text("PUMP".into()))
        );
    }

    #[test]
    fn short_read_yields_none() {
        let dp = point(DataType::Float32, 2, Endianness::Big);
        assert_eq!(decode_registers(&dp, &[0x42F6]), None);
    }

    #[test]
    fn bit_decode_takes_first() {
        assert_eq!(decode_bits(&[true, false]), SampleValue::Bool(true));
        assert_eq!(decode_bits(&[]), SampleValue::Bool(false));
    }

    #[test]
    fn io_error_classification() {
        use std::io::{Error, ErrorKind};
        let cases = [
            (ErrorKind::TimedOut, QualityCode::Timeout),
            (ErrorKind::ConnectionRefused, QualityCode::ConnectionRefused),
            (ErrorKind::ConnectionReset, QualityCode::ConnectionReset),
            (ErrorKind::BrokenPipe, QualityCode::ConnectionReset),
            (ErrorKind::NotFound, QualityCode::PortNotFound),
            (ErrorKind::HostUnreachable, QualityCode::HostUnreachable),
            (ErrorKind::PermissionDenied, QualityCode::ReadError),
        ];
        for (kind, code) in cases {
            assert_eq!(classify_io_error(&Error::new(kind, "x")), code, "{:?}", kind);
        }
    }
}
