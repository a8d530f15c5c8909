/// Deterministic category color via CRC32 hash of the category tag.
/// Returns (r, g, b) from the first 3 bytes of the hash, so every client
/// tints a category's markers identically without any configuration.
pub fn category_color(category: &str) -> (u8, u8, u8) {
    let hash = crc32fast::hash(category.as_bytes());
    let bytes = hash.to_be_bytes();
    (bytes[0], bytes[1], bytes[2])
}
