//! Media type families accepted by the upload endpoints.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFamily {
    Video,
    Image,
}

impl MediaFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaFamily::Video => "video",
            MediaFamily::Image => "image",
        }
    }

    /// Return the subtype of `media_type` if it belongs to this family.
    ///
    /// `video/mp4` is in [`MediaFamily::Video`] with subtype `mp4`. Parameters
    /// after `;` are ignored, an empty subtype never matches.
    pub fn subtype_of<'a>(&self, media_type: &'a str) -> Option<&'a str> {
        let (family, subtype) = split_media_type(media_type)?;
        family
            .eq_ignore_ascii_case(self.as_str())
            .then_some(subtype)
    }
}

impl fmt::Display for MediaFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn split_media_type(value: &str) -> Option<(&str, &str)> {
    let essence = value.split(';').next()?.trim();
    let (family, subtype) = essence.split_once('/')?;
    let valid = |s: &str| {
        !s.is_empty()
            && s
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"!#$&-^_.+".contains(&b))
    };
    (valid(family) && valid(subtype)).then_some((family, subtype))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_family_matches_video_types_only() {
        assert_eq!(MediaFamily::Video.subtype_of("video/mp4"), Some("mp4"));
        assert_eq!(MediaFamily::Video.subtype_of("VIDEO/webm"), Some("webm"));
        assert_eq!(
            MediaFamily::Video.subtype_of("video/mp4; codecs=avc1"),
            Some("mp4")
        );
        assert_eq!(MediaFamily::Video.subtype_of("text/plain"), None);
        assert_eq!(MediaFamily::Video.subtype_of("image/png"), None);
    }

    #[test]
    fn malformed_types_never_match() {
        for value in ["video", "video/", "/mp4", "", "video/../x", "video/mp 4"] {
            assert_eq!(MediaFamily::Video.subtype_of(value), None, "{value}");
        }
    }

    #[test]
    fn image_family_returns_subtype() {
        assert_eq!(MediaFamily::Image.subtype_of("image/jpeg"), Some("jpeg"));
        assert_eq!(MediaFamily::Image.subtype_of("video/mp4"), None);
    }
}
