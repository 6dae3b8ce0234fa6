use crate::constants::{ANSWER_CLOSE, ANSWER_OPEN, THINK_CLOSE, THINK_OPEN};

// Single-pass parser for the upstream's tagged text. The upstream
// interleaves `<think>...</think>` and `<answer>...</answer>` regions, and
// tags may be split across stream chunks; bytes that could begin a tag are
// held back until the next chunk disambiguates them, so at most
// `longest_tag - 1` bytes are ever buffered and no partial tag leaks out.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Answer(String),
    Think(String),
    ThinkStart,
    ThinkEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    // Text outside any tag is treated as answer content.
    Outside,
    Think,
    Answer,
}

#[derive(Debug, Clone, Copy)]
enum Tag {
    ThinkOpen,
    ThinkClose,
    AnswerOpen,
    AnswerClose,
}

const TAGS: [(&str, Tag); 4] = [
    (THINK_OPEN, Tag::ThinkOpen),
    (THINK_CLOSE, Tag::ThinkClose),
    (ANSWER_OPEN, Tag::AnswerOpen),
    (ANSWER_CLOSE, Tag::AnswerClose),
];

fn match_tag(rest: &str) -> Option<(usize, Tag)> {
    TAGS.iter()
        .find(|(literal, _)| rest.starts_with(literal))
        .map(|(literal, tag)| (literal.len(), *tag))
}

// True when `rest` (which runs to the end of the buffer) could still grow
// into a tag once more bytes arrive.
fn is_tag_prefix(rest: &str) -> bool {
    TAGS.iter()
        .any(|(literal, _)| literal.len() > rest.len() && literal.starts_with(rest))
}

#[derive(Debug)]
pub struct TagParser {
    region: Region,
    pending: String,
}

impl Default for TagParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TagParser {
    pub fn new() -> Self {
        Self {
            region: Region::Outside,
            pending: String::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<Segment> {
        self.pending.push_str(chunk);
        let buffer = std::mem::take(&mut self.pending);

        let mut segments = Vec::new();
        let mut text = String::new();
        let mut i = 0;

        while i < buffer.len() {
            let rest = &buffer[i..];
            if rest.starts_with('<') {
                if let Some((len, tag)) = match_tag(rest) {
                    self.flush_text(&mut segments, &mut text);
                    self.apply_tag(tag, &mut segments);
                    i += len;
                    continue;
                }
                if is_tag_prefix(rest) {
                    // Possible tag split across chunks; hold it back.
                    break;
                }
                text.push('<');
                i += 1;
                continue;
            }
            let next_lt = rest.find('<').map(|p| i + p).unwrap_or(buffer.len());
            text.push_str(&buffer[i..next_lt]);
            i = next_lt;
        }

        self.flush_text(&mut segments, &mut text);
        self.pending = buffer[i..].to_string();
        segments
    }

    // End of stream: release any held-back bytes as literal text and close
    // an unterminated think region.
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut tail = std::mem::take(&mut self.pending);
        self.flush_text(&mut segments, &mut tail);
        if self.region == Region::Think {
            segments.push(Segment::ThinkEnd);
            self.region = Region::Outside;
        }
        segments
    }

    fn flush_text(&self, segments: &mut Vec<Segment>, text: &mut String) {
        if text.is_empty() {
            return;
        }
        let taken = std::mem::take(text);
        match self.region {
            Region::Think => segments.push(Segment::Think(taken)),
            Region::Answer | Region::Outside => segments.push(Segment::Answer(taken)),
        }
    }

    fn apply_tag(&mut self, tag: Tag, segments: &mut Vec<Segment>) {
        match tag {
            Tag::ThinkOpen => {
                if self.region != Region::Think {
                    segments.push(Segment::ThinkStart);
                    self.region = Region::Think;
                }
            }
            Tag::ThinkClose => {
                if self.region == Region::Think {
                    segments.push(Segment::ThinkEnd);
                }
                self.region = Region::Outside;
            }
            Tag::AnswerOpen => {
                if self.region == Region::Think {
                    segments.push(Segment::ThinkEnd);
                }
                self.region = Region::Answer;
            }
            Tag::AnswerClose => {
                if self.region == Region::Think {
                    segments.push(Segment::ThinkEnd);
                }
                self.region = Region::Outside;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> Vec<Segment> {
        let mut parser = TagParser::new();
        let mut segments = Vec::new();
        for chunk in chunks {
            segments.extend(parser.feed(chunk));
        }
        segments.extend(parser.finish());
        segments
    }

    fn answer_text(segments: &[Segment]) -> String {
        segments
            .iter()
            .filter_map(|s| match s {
                Segment::Answer(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn think_text(segments: &[Segment]) -> String {
        segments
            .iter()
            .filter_map(|s| match s {
                Segment::Think(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn answer_region_is_extracted() {
        let segments = run(&["<answer>Hello</answer>"]);
        assert_eq!(answer_text(&segments), "Hello");
        assert_eq!(think_text(&segments), "");
    }

    #[test]
    fn think_and_answer_regions_are_separated() {
        let segments = run(&["<think>reasoning</think><answer>42</answer>"]);
        assert_eq!(think_text(&segments), "reasoning");
        assert_eq!(answer_text(&segments), "42");
        assert_eq!(segments[0], Segment::ThinkStart);
        assert!(segments.contains(&Segment::ThinkEnd));
    }

    #[test]
    fn untagged_text_counts_as_answer() {
        let segments = run(&["plain text, no tags"]);
        assert_eq!(answer_text(&segments), "plain text, no tags");
    }

    #[test]
    fn tag_split_across_chunks_does_not_leak() {
        let segments = run(&["<thi", "nk>hidden</think><answer>shown</answer>"]);
        assert_eq!(think_text(&segments), "hidden");
        assert_eq!(answer_text(&segments), "shown");
        assert!(!answer_text(&segments).contains("<thi"));
    }

    #[test]
    fn closing_tag_split_across_chunks() {
        let segments = run(&["<answer>The answer is", " 42</answ", "er>"]);
        assert_eq!(answer_text(&segments), "The answer is 42");
    }

    #[test]
    fn split_at_every_byte_boundary_is_lossless() {
        let input = "<think>abc</think><answer>def</answer>";
        for split in 1..input.len() {
            if !input.is_char_boundary(split) {
                continue;
            }
            let segments = run(&[&input[..split], &input[split..]]);
            assert_eq!(think_text(&segments), "abc", "split at {}", split);
            assert_eq!(answer_text(&segments), "def", "split at {}", split);
        }
    }

    #[test]
    fn angle_bracket_that_is_not_a_tag_passes_through() {
        let segments = run(&["<answer>a < b and x <y> z</answer>"]);
        assert_eq!(answer_text(&segments), "a < b and x <y> z");
    }

    #[test]
    fn unterminated_think_is_closed_at_eof() {
        let segments = run(&["<think>never closed"]);
        assert_eq!(think_text(&segments), "never closed");
        assert_eq!(segments.last(), Some(&Segment::ThinkEnd));
    }

    #[test]
    fn partial_tag_at_eof_is_released_as_text() {
        let segments = run(&["<answer>done</answ"]);
        assert_eq!(answer_text(&segments), "done</answ");
    }

    #[test]
    fn repeated_regions_accumulate_in_order() {
        let segments = run(&[
            "<think>one</think><answer>A</answer><think>two</think><answer>B</answer>",
        ]);
        assert_eq!(think_text(&segments), "onetwo");
        assert_eq!(answer_text(&segments), "AB");
    }

    #[test]
    fn answer_open_inside_think_closes_the_think_region() {
        let segments = run(&["<think>partial<answer>out</answer>"]);
        assert_eq!(think_text(&segments), "partial");
        assert_eq!(answer_text(&segments), "out");
    }

    #[test]
    fn multibyte_content_survives_chunking() {
        let input = "<answer>héllo wörld — ok</answer>";
        let mid = input
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= input.len() / 2)
            .unwrap();
        let segments = run(&[&input[..mid], &input[mid..]]);
        assert_eq!(answer_text(&segments), "héllo wörld — ok");
    }
}
