//! Strict positional plist walker (spec §4.3): not a general XML parser —
//! it expects the UDIF resource-fork plist's exact tag sequence and fails
//! closed on anything else, skipping unknown resource-fork keys wholesale.

use base64::Engine;

use crate::error::{Result, VdiskError};

const MAX_ARRAY_ENTRIES: usize = 10;

pub struct ResourceFork {
    /// Base64-decoded `Data` blob for each `<dict>` in the `blkx` array, in
    /// document order.
    pub blkx_entries: Vec<Vec<u8>>,
}

struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Scanner { buf, pos: 0 }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.buf.len() && self.buf[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn literal(&mut self, lit: &str) -> Result<()> {
        self.skip_ws();
        if self.buf[self.pos..].starts_with(lit.as_bytes()) {
            self.pos += lit.len();
            Ok(())
        } else {
            Err(VdiskError::bad_device(format!(
                "DMG plist: expected {lit:?} at byte {}",
                self.pos
            )))
        }
    }

    fn find_from_here(&mut self, needle: &str) -> Result<usize> {
        let rest = std::str::from_utf8(&self.buf[self.pos..])
            .map_err(|_| VdiskError::bad_device("DMG plist is not valid UTF-8"))?;
        let idx = rest
            .find(needle)
            .ok_or_else(|| VdiskError::bad_device(format!("DMG plist: missing {needle:?}")))?;
        Ok(self.pos + idx)
    }

    fn skip_to_after(&mut self, needle: &str) -> Result<()> {
        let idx = self.find_from_here(needle)?;
        self.pos = idx + needle.len();
        Ok(())
    }

    /// Parses `<key>NAME</key>` and returns NAME, or `None` if the next
    /// non-whitespace content is not a `<key>` tag (used to detect the end
    /// of a dict).
    fn try_key(&mut self) -> Result<Option<String>> {
        self.skip_ws();
        if !self.buf[self.pos..].starts_with(b"<key>") {
            return Ok(None);
        }
        self.pos += "<key>".len();
        let end = self.find_from_here("</key>")?;
        let name = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| VdiskError::bad_device("DMG plist key is not valid UTF-8"))?
            .to_string();
        self.pos = end + "</key>".len();
        Ok(Some(name))
    }

    /// Parses one value tag (`<string>`, `<integer>`, `<data>`, ...) and
    /// returns its tag name and raw inner text.
    fn value(&mut self) -> Result<(String, String)> {
        self.skip_ws();
        if self.buf.get(self.pos) != Some(&b'<') {
            return Err(VdiskError::bad_device("DMG plist: expected a value tag"));
        }
        let name_start = self.pos + 1;
        let name_end = self.find_from_here(">")?;
        let tag = std::str::from_utf8(&self.buf[name_start..name_end])
            .map_err(|_| VdiskError::bad_device("DMG plist tag is not valid UTF-8"))?
            .to_string();
        self.pos = name_end + 1;
        let close = format!("</{tag}>");
        let content_end = self.find_from_here(&close)?;
        let content = std::str::from_utf8(&self.buf[self.pos..content_end])
            .map_err(|_| VdiskError::bad_device("DMG plist value is not valid UTF-8"))?
            .to_string();
        self.pos = content_end + close.len();
        Ok((tag, content))
    }

    /// Parses `<array>...</array>`, where each entry is a `<dict>` of
    /// key/value pairs. `want_data` controls whether the caller cares about
    /// a `Data` key's decoded bytes (blkx) or the array is walked only to
    /// find its end (plst, or any other recognized-but-unused key).
    fn array(&mut self, want_data: bool) -> Result<Vec<Vec<u8>>> {
        self.literal("<array>")?;
        let mut out = Vec::new();
        loop {
            self.skip_ws();
            if self.buf[self.pos..].starts_with(b"</array>") {
                self.pos += "</array>".len();
                return Ok(out);
            }
            if out.len() >= MAX_ARRAY_ENTRIES {
                return Err(VdiskError::bad_device("DMG plist array exceeds 10 entries"));
            }
            self.literal("<dict>")?;
            let mut data_blob = None;
            while let Some(key) = self.try_key()? {
                let (tag, content) = self.value()?;
                if want_data && key == "Data" && tag == "data" {
                    let cleaned: String = content.chars().filter(|c| !c.is_whitespace()).collect();
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(cleaned.as_bytes())
                        .map_err(|e| VdiskError::bad_device(format!("DMG plist Data is not valid base64: {e}")))?;
                    data_blob = Some(decoded);
                }
            }
            self.literal("</dict>")?;
            out.push(data_blob.unwrap_or_default());
        }
    }
}

/// Walks the exact tag sequence `<?xml ...?> <!DOCTYPE plist ...> <plist
/// version="1.0"> <dict> <key>resource-fork</key> <dict> ... </dict>
/// </dict> </plist>`, collecting the `blkx` array's `Data` blobs.
pub fn parse_resource_fork(xml: &[u8]) -> Result<ResourceFork> {
    let mut s = Scanner::new(xml);
    s.skip_to_after("?>")?; // <?xml ... ?>
    s.skip_to_after("<!DOCTYPE plist")?;
    s.skip_to_after(">")?;
    s.literal("<plist version=\"1.0\">")?;
    s.literal("<dict>")?;
    s.literal("<key>resource-fork</key>")?;
    s.literal("<dict>")?;

    let mut blkx_entries = Vec::new();
    while let Some(key) = s.try_key()? {
        match key.as_str() {
            "blkx" => blkx_entries = s.array(true)?,
            "plst" => {
                s.array(false)?;
            }
            _ => s.skip_to_after("</array>")?,
        }
    }
    s.literal("</dict>")?; // closes resource-fork dict
    s.literal("</dict>")?; // closes outer dict
    s.literal("</plist>")?;

    Ok(ResourceFork { blkx_entries })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(body: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"x\">\n\
             <plist version=\"1.0\">\n<dict>\n<key>resource-fork</key>\n<dict>\n{body}</dict>\n</dict>\n</plist>\n"
        )
    }

    #[test]
    fn parses_single_blkx_entry_with_data() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"mish-payload");
        let body = format!(
            "<key>blkx</key>\n<array>\n<dict>\n<key>Attributes</key>\n<string>0x0050</string>\n\
             <key>Data</key>\n<data>\n{encoded}\n</data>\n<key>Name</key>\n<string>whole disk</string>\n</dict>\n</array>\n"
        );
        let doc = wrap(&body);
        let rf = parse_resource_fork(doc.as_bytes()).unwrap();
        assert_eq!(rf.blkx_entries.len(), 1);
        assert_eq!(rf.blkx_entries[0], b"mish-payload");
    }

    #[test]
    fn unknown_key_is_skipped_wholesale() {
        let body = "<key>something-else</key>\n<array>\n<dict>\n<key>x</key>\n<string>y</string>\n</dict>\n</array>\n\
                    <key>blkx</key>\n<array>\n</array>\n";
        let doc = wrap(body);
        let rf = parse_resource_fork(doc.as_bytes()).unwrap();
        assert!(rf.blkx_entries.is_empty());
    }

    #[test]
    fn more_than_ten_array_entries_rejected() {
        let mut body = String::from("<key>blkx</key>\n<array>\n");
        for _ in 0..11 {
            body.push_str("<dict>\n</dict>\n");
        }
        body.push_str("</array>\n");
        let doc = wrap(&body);
        assert!(parse_resource_fork(doc.as_bytes()).is_err());
    }
}
