pub const ENTRY_PREFIX: &[u8] = b"E:";
pub const CHILD_PREFIX: &[u8] = b"C:";

/// Build an entry key that looks like `E:<id>`
pub fn kv_key_entry(id: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(ENTRY_PREFIX.len() + id.len());
    v.extend_from_slice(ENTRY_PREFIX);
    v.extend_from_slice(id.as_bytes());
    v
}

/// Prefix shared by every child key of `parent_id`: `C:<parent>/`
pub fn kv_child_prefix(parent_id: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(CHILD_PREFIX.len() + parent_id.len() + 1);
    v.extend_from_slice(CHILD_PREFIX);
    v.extend_from_slice(parent_id.as_bytes());
    v.push(b'/');
    v
}

/// Child index key `C:<parent>/<id>`
pub fn kv_key_child(parent_id: &str, id: &str) -> Vec<u8> {
    let mut v = kv_child_prefix(parent_id);
    v.extend_from_slice(id.as_bytes());
    v
}

/// Document path of an entry in the document store
pub fn doc_entry_path(id: &str) -> String {
    format!("entries/{}.json", id)
}

pub fn doc_child_prefix(parent_id: &str) -> String {
    format!("children/{}", parent_id)
}

pub fn doc_child_path(parent_id: &str, id: &str) -> String {
    format!("children/{}/{}", parent_id, id)
}
