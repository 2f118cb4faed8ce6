use crate::buffer::PAGE_SIZE;
use crate::error::{TidepoolError, TidepoolResult};
use crate::storage::codec::{CommonCodec, DecodedData};
use crate::storage::page::{
    BPlusTreeHeaderPage, BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage,
    BPlusTreePageType, RecordId,
};

/// Every page kind encodes to exactly `PAGE_SIZE` bytes. Nodes share a
/// `(page_type, current_size, max_size)` header; leaf pages add the next
/// pointer; entries are length-prefixed keys followed by their value.

pub struct RecordIdCodec;

impl RecordIdCodec {
    pub fn encode(rid: &RecordId) -> Vec<u8> {
        let mut bytes = CommonCodec::encode_i32(rid.page_id);
        bytes.extend(CommonCodec::encode_u32(rid.slot_num));
        bytes
    }

    pub fn decode(bytes: &[u8]) -> TidepoolResult<DecodedData<RecordId>> {
        let (page_id, o1) = CommonCodec::decode_i32(bytes)?;
        let (slot_num, o2) = CommonCodec::decode_u32(&bytes[o1..])?;
        Ok((RecordId::new(page_id, slot_num), o1 + o2))
    }
}

pub struct BPlusTreeHeaderPageCodec;

impl BPlusTreeHeaderPageCodec {
    pub fn encode(page: &BPlusTreeHeaderPage) -> Vec<u8> {
        let mut bytes = CommonCodec::encode_i32(page.root_page_id);
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> TidepoolResult<DecodedData<BPlusTreeHeaderPage>> {
        check_page_len(bytes)?;
        let (root_page_id, offset) = CommonCodec::decode_i32(bytes)?;
        Ok((BPlusTreeHeaderPage { root_page_id }, offset))
    }
}

struct PageTypeCodec;

impl PageTypeCodec {
    fn encode(page_type: BPlusTreePageType) -> Vec<u8> {
        match page_type {
            BPlusTreePageType::LeafPage => CommonCodec::encode_u8(1),
            BPlusTreePageType::InternalPage => CommonCodec::encode_u8(2),
        }
    }

    fn decode(bytes: &[u8]) -> TidepoolResult<DecodedData<BPlusTreePageType>> {
        let (flag, offset) = CommonCodec::decode_u8(bytes)?;
        match flag {
            1 => Ok((BPlusTreePageType::LeafPage, offset)),
            2 => Ok((BPlusTreePageType::InternalPage, offset)),
            _ => Err(TidepoolError::Storage(format!("invalid page type {}", flag))),
        }
    }
}

pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode(page: &BPlusTreePage) -> Vec<u8> {
        match page {
            BPlusTreePage::Leaf(page) => BPlusTreeLeafPageCodec::encode(page),
            BPlusTreePage::Internal(page) => BPlusTreeInternalPageCodec::encode(page),
        }
    }

    pub fn decode(bytes: &[u8]) -> TidepoolResult<DecodedData<BPlusTreePage>> {
        check_page_len(bytes)?;
        let (page_type, _) = PageTypeCodec::decode(bytes)?;
        match page_type {
            BPlusTreePageType::LeafPage => {
                let (page, offset) = BPlusTreeLeafPageCodec::decode(bytes)?;
                Ok((BPlusTreePage::Leaf(page), offset))
            }
            BPlusTreePageType::InternalPage => {
                let (page, offset) = BPlusTreeInternalPageCodec::decode(bytes)?;
                Ok((BPlusTreePage::Internal(page), offset))
            }
        }
    }
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode(page: &BPlusTreeLeafPage) -> Vec<u8> {
        let mut bytes = PageTypeCodec::encode(BPlusTreePageType::LeafPage);
        bytes.extend(CommonCodec::encode_u32(page.size() as u32));
        bytes.extend(CommonCodec::encode_u32(page.max_size));
        bytes.extend(CommonCodec::encode_i32(page.next_page_id));
        for (key, rid) in page.array.iter() {
            bytes.extend(CommonCodec::encode_bytes(key));
            bytes.extend(RecordIdCodec::encode(rid));
        }
        assert!(bytes.len() <= PAGE_SIZE, "leaf page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> TidepoolResult<DecodedData<BPlusTreeLeafPage>> {
        check_page_len(bytes)?;
        let (page_type, mut offset) = PageTypeCodec::decode(bytes)?;
        if page_type != BPlusTreePageType::LeafPage {
            return Err(TidepoolError::Storage(
                "page type must be leaf page".to_string(),
            ));
        }
        let (current_size, o) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += o;
        let (max_size, o) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += o;
        let (next_page_id, o) = CommonCodec::decode_i32(&bytes[offset..])?;
        offset += o;

        let mut array = Vec::with_capacity(current_size as usize);
        for _ in 0..current_size {
            let (key, o) = CommonCodec::decode_bytes(&bytes[offset..])?;
            offset += o;
            let (rid, o) = RecordIdCodec::decode(&bytes[offset..])?;
            offset += o;
            array.push((key, rid));
        }

        Ok((
            BPlusTreeLeafPage {
                max_size,
                next_page_id,
                array,
            },
            PAGE_SIZE,
        ))
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode(page: &BPlusTreeInternalPage) -> Vec<u8> {
        let mut bytes = PageTypeCodec::encode(BPlusTreePageType::InternalPage);
        bytes.extend(CommonCodec::encode_u32(page.size() as u32));
        bytes.extend(CommonCodec::encode_u32(page.max_size));
        for (key, child) in page.array.iter() {
            bytes.extend(CommonCodec::encode_bytes(key));
            bytes.extend(CommonCodec::encode_i32(*child));
        }
        assert!(bytes.len() <= PAGE_SIZE, "internal page overflows page size");
        bytes.resize(PAGE_SIZE, 0);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> TidepoolResult<DecodedData<BPlusTreeInternalPage>> {
        check_page_len(bytes)?;
        let (page_type, mut offset) = PageTypeCodec::decode(bytes)?;
        if page_type != BPlusTreePageType::InternalPage {
            return Err(TidepoolError::Storage(
                "page type must be internal page".to_string(),
            ));
        }
        let (current_size, o) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += o;
        let (max_size, o) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += o;

        let mut array = Vec::with_capacity(current_size as usize + 1);
        for _ in 0..current_size {
            let (key, o) = CommonCodec::decode_bytes(&bytes[offset..])?;
            offset += o;
            let (child, o) = CommonCodec::decode_i32(&bytes[offset..])?;
            offset += o;
            array.push((key, child));
        }

        Ok((BPlusTreeInternalPage { max_size, array }, PAGE_SIZE))
    }
}

fn check_page_len(bytes: &[u8]) -> TidepoolResult<()> {
    if bytes.len() != PAGE_SIZE {
        return Err(TidepoolError::Storage(format!(
            "page size is {} instead of {}",
            bytes.len(),
            PAGE_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::INVALID_PAGE_ID;
    use crate::storage::index::comparator::default_comparator as cmp;

    #[test]
    fn header_page_codec_round_trips() {
        let page = BPlusTreeHeaderPage { root_page_id: 42 };
        let (decoded, _) = BPlusTreeHeaderPageCodec::decode(&BPlusTreeHeaderPageCodec::encode(&page)).unwrap();
        assert_eq!(decoded, page);

        let empty = BPlusTreeHeaderPage::empty();
        let (decoded, _) = BPlusTreeHeaderPageCodec::decode(&BPlusTreeHeaderPageCodec::encode(&empty)).unwrap();
        assert_eq!(decoded.root_page_id, INVALID_PAGE_ID);
    }

    #[test]
    fn leaf_page_codec_round_trips() {
        let mut leaf = BPlusTreeLeafPage::new(8);
        leaf.next_page_id = 17;
        leaf.insert(b"apple".to_vec(), RecordId::new(1, 1), cmp);
        leaf.insert(b"pear".to_vec(), RecordId::new(2, 2), cmp);

        let page = BPlusTreePage::Leaf(leaf);
        let (decoded, _) = BPlusTreePageCodec::decode(&BPlusTreePageCodec::encode(&page)).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn internal_page_codec_round_trips() {
        let mut node = BPlusTreeInternalPage::new(8);
        node.populate_new_root(3, b"melon".to_vec(), 4);
        node.insert(b"plum".to_vec(), 5, cmp);

        let page = BPlusTreePage::Internal(node);
        let (decoded, _) = BPlusTreePageCodec::decode(&BPlusTreePageCodec::encode(&page)).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn zeroed_page_is_not_a_valid_node() {
        let bytes = vec![0u8; PAGE_SIZE];
        assert!(BPlusTreePageCodec::decode(&bytes).is_err());
    }
}
