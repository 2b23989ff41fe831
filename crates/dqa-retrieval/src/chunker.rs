use dqa_core::Chunk;
use dqa_error::{DqaError, Result};
use tracing::warn;

// 句子终止符，兼顾中英文语料
const SENTENCE_TERMINATORS: [char; 6] = ['.', '!', '?', '。', '！', '？'];

/// 句子对齐的文本分块器
///
/// 在句子边界上累积字符预算，相邻块之间携带 overlap 尾部以保留跨界上下文。
/// 同一输入与参数总是产出相同的块边界。
#[derive(Debug)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(DqaError::Configuration {
                key: "chunk_size".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if overlap >= chunk_size {
            return Err(DqaError::Configuration {
                key: "chunk_overlap".to_string(),
                reason: format!("overlap {} must be smaller than chunk_size {}", overlap, chunk_size),
            });
        }
        Ok(Self { chunk_size, overlap })
    }

    /// 将文档文本切分为有序块序列
    pub fn chunk(&self, document_id: &str, text: &str) -> Vec<Chunk> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            warn!(document_id = %document_id, "empty text provided for chunking");
            return Vec::new();
        }

        // 超长句在字符上限处强制切开，其余保持句子完整
        let mut pieces: Vec<String> = Vec::new();
        for sentence in split_sentences(trimmed) {
            if sentence.chars().count() > self.chunk_size {
                pieces.extend(force_split(&sentence, self.chunk_size));
            } else {
                pieces.push(sentence);
            }
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_len = 0usize;
        let mut start = 0usize;

        for piece in pieces {
            let piece_len = piece.chars().count();
            let projected = if current.is_empty() {
                piece_len
            } else {
                current_len + 1 + piece_len
            };

            if projected > self.chunk_size && !current.is_empty() {
                let chunk_text = current.join(" ");
                let chunk_chars = chunk_text.chars().count();
                chunks.push(self.make_chunk(document_id, chunks.len(), &chunk_text, start));

                let tail = self.overlap_tail(&chunk_text);
                let tail_chars = tail.chars().count();
                // 尾部无法与下一片共存于预算内时放弃携带，块长度不得超出 chunk_size
                if tail_chars > 0 && tail_chars + 1 + piece_len <= self.chunk_size {
                    start += chunk_chars - tail_chars;
                    current = vec![tail];
                    current_len = tail_chars;
                } else {
                    start += chunk_chars;
                    current = Vec::new();
                    current_len = 0;
                }
            }

            if current.is_empty() {
                current_len = piece_len;
            } else {
                current_len += 1 + piece_len;
            }
            current.push(piece);
        }

        if !current.is_empty() {
            let chunk_text = current.join(" ");
            if !chunk_text.trim().is_empty() {
                chunks.push(self.make_chunk(document_id, chunks.len(), &chunk_text, start));
            }
        }

        chunks
    }

    fn make_chunk(&self, document_id: &str, index: usize, text: &str, start: usize) -> Chunk {
        let chars = text.chars().count();
        Chunk {
            chunk_id: format!("{}_{}", document_id, index),
            document_id: document_id.to_string(),
            chunk_index: index as i32,
            text: text.to_string(),
            start_offset: start as i32,
            end_offset: (start + chars) as i32,
            page: None,
            section: None,
        }
    }

    /// 取块尾 overlap 个字符，并裁剪到词边界
    fn overlap_tail(&self, text: &str) -> String {
        if self.overlap == 0 {
            return String::new();
        }
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= self.overlap {
            return text.to_string();
        }
        let tail: String = chars[chars.len() - self.overlap..].iter().collect();
        match tail.find(' ') {
            Some(pos) if pos + 1 < tail.len() => tail[pos + 1..].to_string(),
            _ => tail,
        }
    }
}

/// 按句子终止符切分文本，保留终止符
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if SENTENCE_TERMINATORS.contains(&c) {
            // 终止符后的空白归入句间分隔
            let ends_here = chars.peek().map(|n| n.is_whitespace()).unwrap_or(true);
            if ends_here {
                while chars.peek().map(|n| n.is_whitespace()).unwrap_or(false) {
                    chars.next();
                }
                let s = current.trim().to_string();
                if !s.is_empty() {
                    sentences.push(s);
                }
                current.clear();
            }
        }
    }

    let s = current.trim().to_string();
    if !s.is_empty() {
        sentences.push(s);
    }
    sentences
}

/// 在字符上限处硬切超长句
fn force_split(sentence: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = sentence.chars().collect();
    chars
        .chunks(limit)
        .map(|c| c.iter().collect::<String>())
        .collect()
}
