use crate::error::{TidepoolError, TidepoolResult};
use crate::storage::codec::DecodedData;

/// Big-endian field codecs shared by every page layout.
pub struct CommonCodec;

impl CommonCodec {
    pub fn encode_u8(data: u8) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u8(bytes: &[u8]) -> TidepoolResult<DecodedData<u8>> {
        check_len(bytes, 1)?;
        Ok((bytes[0], 1))
    }

    pub fn encode_u32(data: u32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u32(bytes: &[u8]) -> TidepoolResult<DecodedData<u32>> {
        check_len(bytes, 4)?;
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((u32::from_be_bytes(data), 4))
    }

    pub fn encode_i32(data: i32) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_i32(bytes: &[u8]) -> TidepoolResult<DecodedData<i32>> {
        check_len(bytes, 4)?;
        let data = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok((i32::from_be_bytes(data), 4))
    }

    pub fn encode_u64(data: u64) -> Vec<u8> {
        data.to_be_bytes().to_vec()
    }

    pub fn decode_u64(bytes: &[u8]) -> TidepoolResult<DecodedData<u64>> {
        check_len(bytes, 8)?;
        let mut data = [0u8; 8];
        data.copy_from_slice(&bytes[..8]);
        Ok((u64::from_be_bytes(data), 8))
    }

    /// Length-prefixed byte string.
    pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
        let mut bytes = CommonCodec::encode_u32(data.len() as u32);
        bytes.extend_from_slice(data);
        bytes
    }

    pub fn decode_bytes(bytes: &[u8]) -> TidepoolResult<DecodedData<Vec<u8>>> {
        let (len, offset) = CommonCodec::decode_u32(bytes)?;
        let len = len as usize;
        check_len(&bytes[offset..], len)?;
        Ok((bytes[offset..offset + len].to_vec(), offset + len))
    }
}

fn check_len(bytes: &[u8], need: usize) -> TidepoolResult<()> {
    if bytes.len() < need {
        return Err(TidepoolError::Internal(format!(
            "bytes length {} is less than {}",
            bytes.len(),
            need
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips() {
        assert_eq!(CommonCodec::decode_u32(&CommonCodec::encode_u32(77)).unwrap().0, 77);
        assert_eq!(CommonCodec::decode_i32(&CommonCodec::encode_i32(-1)).unwrap().0, -1);
        assert_eq!(
            CommonCodec::decode_u64(&CommonCodec::encode_u64(u64::MAX)).unwrap().0,
            u64::MAX
        );
    }

    #[test]
    fn bytes_round_trip_records_consumed_length() {
        let encoded = CommonCodec::encode_bytes(b"tide");
        let (decoded, consumed) = CommonCodec::decode_bytes(&encoded).unwrap();
        assert_eq!(decoded, b"tide");
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(CommonCodec::decode_u32(&[1, 2]).is_err());
        assert!(CommonCodec::decode_bytes(&CommonCodec::encode_u32(10)).is_err());
    }
}
