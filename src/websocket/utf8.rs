//! Incremental UTF-8 validation for text messages

/// Validates UTF-8 across message fragments.
///
/// A multi-byte sequence may be split between two fragments; the leading
/// bytes are kept until the rest arrives.
#[derive(Debug, Default)]
pub struct Utf8Validator {
    pending: [u8; 4],
    pending_len: usize,
}

fn sequence_len(first: u8) -> Option<usize> {
    match first {
        0xc2..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf4 => Some(4),
        _ => None,
    }
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` as soon as the bytes seen so far cannot be valid.
    /// At `end_of_message` an unfinished sequence is invalid too, and the
    /// validator resets for the next message.
    pub fn validate(&mut self, data: &[u8], end_of_message: bool) -> bool {
        let valid = self.feed(data) && !(end_of_message && self.pending_len > 0);
        if end_of_message || !valid {
            self.pending_len = 0;
        }
        valid
    }

    fn feed(&mut self, mut data: &[u8]) -> bool {
        if self.pending_len > 0 {
            let Some(expected) = sequence_len(self.pending[0]) else {
                return false;
            };
            let take = (expected - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];

            match std::str::from_utf8(&self.pending[..self.pending_len]) {
                Ok(_) => self.pending_len = 0,
                Err(err) if err.error_len().is_some() => return false,
                Err(_) => return true,
            }
        }

        match std::str::from_utf8(data) {
            Ok(_) => true,
            Err(err) if err.error_len().is_some() => false,
            Err(err) => {
                let tail = &data[err.valid_up_to()..];
                self.pending[..tail.len()].copy_from_slice(tail);
                self.pending_len = tail.len();
                true
            }
        }
    }
}
