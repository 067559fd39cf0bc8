// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: drive the full logit-lens pipeline against a
//! synthetic backend.
//!
//! The backend embeds prompt tokens with a real [`LensHead`], applies a
//! fixed affine map per decoder block (consulting the hook registry at
//! every block boundary) and returns a canned caption. Everything else
//! (tiling, prompt composition, tokenization, alignment, projection and
//! confidence reduction) runs unmodified.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::missing_docs_in_private_items,
    clippy::missing_panics_doc,
    missing_docs
)]

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{D, DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_vlm_lens::interp::logit_lens::{project_with, row_sums};
use candle_vlm_lens::{
    ClassTokens, ConfidenceReport, GenerationConfig, GenerationOutput, GenerationRequest,
    HiddenStateStack, HookPoint, HookRegistry, ImageTokenSpan, LensError, LensHead, LensOptions,
    LensTokenizer, ModelState, SpecialTokenPolicy, VisionLanguageConfig, VlmBackend, VlmModel,
    analyze_class, caption_image, retrieve_logit_lens,
};
use image::{Rgb, RgbImage};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const HIDDEN: usize = 4;
const VOCAB: usize = 18;
const DECODER_BLOCKS: usize = 2;
const IM_END: u32 = 14;
const IMG_CONTEXT: u32 = 17;
const CAT: u32 = 1;

/// `config.json` of a miniature InternVL checkpoint: 32 px tiles, 4 px
/// patches, ratio 0.5 → 16 image tokens per tile.
fn checkpoint_config() -> VisionLanguageConfig {
    let json = serde_json::json!({
        "model_type": "internvl_chat",
        "template": "internvl2_5",
        "force_image_size": 32,
        "downsample_ratio": 0.5,
        "max_dynamic_patch": 4,
        "vision_config": { "image_size": 32, "patch_size": 4 },
        "llm_config": {
            "architectures": ["Qwen2ForCausalLM"],
            "hidden_size": HIDDEN,
            "num_hidden_layers": DECODER_BLOCKS,
            "vocab_size": VOCAB,
            "tie_word_embeddings": true
        }
    });
    VisionLanguageConfig::from_hf_config(&json).unwrap()
}

/// Word-level tokenizer whose chat markers are special added tokens.
fn tokenizer() -> LensTokenizer {
    let special = [
        (13, "<|im_start|>"),
        (14, "<|im_end|>"),
        (15, "<img>"),
        (16, "</img>"),
        (17, "<IMG_CONTEXT>"),
    ];
    let added: Vec<serde_json::Value> = special
        .iter()
        .map(|(id, content)| {
            serde_json::json!({
                "id": id, "content": content, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        })
        .collect();
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "unk_token": "[UNK]",
            "vocab": {
                "[UNK]": 0, "cat": 1, "dog": 2, "tabby": 3, "the": 4, "on": 5,
                "mat": 6, "Describe": 7, ".": 8, "system": 9, "user": 10,
                "assistant": 11, "S": 12, "<|im_start|>": 13, "<|im_end|>": 14,
                "<img>": 15, "</img>": 16, "<IMG_CONTEXT>": 17
            }
        }
    });
    let tok = tokenizers::Tokenizer::from_str(&json.to_string()).unwrap();
    LensTokenizer::from_hf(tok)
}

/// Deterministic `[VOCAB, HIDDEN]` embedding table.
fn embedding_table() -> Tensor {
    let data: Vec<f32> = (0..VOCAB * HIDDEN)
        .map(|i| f32::from(u8::try_from((i * 5) % 11).unwrap()) / 11.0 - 0.5)
        .collect();
    Tensor::from_vec(data, (VOCAB, HIDDEN), &Device::Cpu).unwrap()
}

/// Vocabulary head loaded the way a checkpoint would be.
fn head() -> LensHead {
    let tensors: HashMap<String, Tensor> = [(
        "language_model.model.embed_tokens.weight".to_owned(),
        embedding_table(),
    )]
    .into_iter()
    .collect();
    let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
    LensHead::load(&checkpoint_config(), vb).unwrap()
}

/// What the backend saw on its last call.
#[derive(Default)]
struct Recorded {
    config: Option<GenerationConfig>,
    tiles: Option<usize>,
    mask: Vec<u32>,
}

struct MockBackend {
    head: LensHead,
    num_image_token: usize,
    caption: Vec<u32>,
    recorded: Arc<Mutex<Recorded>>,
}

impl MockBackend {
    /// One decoder block: `h * 0.5 + 1`.
    fn block(h: &Tensor) -> candle_vlm_lens::Result<Tensor> {
        Ok(h.affine(0.5, 1.0)?)
    }
}

impl VlmBackend for MockBackend {
    fn num_layers(&self) -> usize {
        DECODER_BLOCKS
    }

    fn hidden_size(&self) -> usize {
        HIDDEN
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn num_image_token(&self) -> usize {
        self.num_image_token
    }

    fn template_name(&self) -> &str {
        "internvl2_5"
    }

    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        hooks: &HookRegistry,
    ) -> candle_vlm_lens::Result<GenerationOutput> {
        {
            let mut rec = self.recorded.lock().unwrap();
            rec.config = Some(request.config.clone());
            rec.tiles = request.pixel_values.map(|p| p.num_tiles());
            rec.mask = request.attention_mask.squeeze(0)?.to_vec1()?;
        }

        let mut h = hooks.apply(&HookPoint::Embed, self.head.embed(request.input_ids)?)?;
        let mut layers = vec![h.clone()];
        for block in 0..DECODER_BLOCKS {
            h = hooks.apply(&HookPoint::ResidPre(block), h)?;
            h = Self::block(&h)?;
            h = hooks.apply(&HookPoint::ResidPost(block), h)?;
            layers.push(h.clone());
        }

        let hidden_states = if request.output_hidden_states {
            Some(HiddenStateStack::from_layers(&layers)?)
        } else {
            None
        };
        let beams = request.config.num_beams;
        Ok(GenerationOutput {
            sequences: vec![self.caption.clone(); beams],
            hidden_states,
        })
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> candle_vlm_lens::Result<Tensor> {
        self.head.project(hidden)
    }

    fn embed_tokens(&self, ids: &Tensor) -> candle_vlm_lens::Result<Tensor> {
        self.head.embed(ids)
    }
}

fn state_with(recorded: Arc<Mutex<Recorded>>) -> ModelState {
    let config = checkpoint_config();
    let backend = MockBackend {
        head: head(),
        num_image_token: config.num_image_token,
        // "the cat on the mat <|im_end|>"
        caption: vec![4, 1, 5, 4, 6, IM_END],
        recorded,
    };
    let model = VlmModel::new(Box::new(backend), Device::Cpu);
    ModelState::new(model, tokenizer(), "mock/InternVL-tiny").unwrap()
}

fn state() -> ModelState {
    state_with(Arc::default())
}

fn options() -> LensOptions {
    let mut opts = LensOptions::from_json(
        r#"{"text_prompt": "Describe the cat .", "system_message": "S", "tiling": {"tile_size": 32, "max_tiles": 1}}"#,
    )
    .unwrap();
    opts.max_new_tokens = 8;
    opts
}

fn write_image(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([u8::try_from(x % 256).unwrap(), u8::try_from(y % 256).unwrap(), 128])
    })
    .save(&path)
    .unwrap();
    path
}

fn assert_rows_normalised(t: &Tensor) {
    let sums: Vec<f32> = t.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert!(!sums.is_empty());
    for s in sums {
        assert!((s - 1.0).abs() < 1e-5, "row sums to {s}");
    }
}

// ---------------------------------------------------------------------------
// Synthetic stack: layers=3, batch=1, positions=20, hidden=4
// ---------------------------------------------------------------------------

#[test]
fn synthetic_stack_projects_and_aggregates() {
    let data: Vec<f32> = (0..3 * 20 * HIDDEN)
        .map(|i| f32::from(u16::try_from(i).unwrap()) / 100.0 - 1.0)
        .collect();
    let stack =
        HiddenStateStack::new(Tensor::from_vec(data, (3, 1, 20, HIDDEN), &Device::Cpu).unwrap())
            .unwrap();
    let head = head();

    let full = project_with(&stack, |h| head.project(h)).unwrap();
    assert_eq!(full.tensor().dims(), &[1, 3, 20, VOCAB]);
    assert_rows_normalised(full.tensor());
    for s in row_sums(&full).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap() {
        assert!((s - 1.0).abs() < 1e-5);
    }

    let span = ImageTokenSpan { start: 2, len: 16 };
    let image = project_with(&stack.narrow_positions(span).unwrap(), |h| head.project(h)).unwrap();
    assert_eq!(image.num_positions(), 16);

    let class = ClassTokens::from_ids("cat", vec![CAT, 3]).unwrap();
    let report = ConfidenceReport::compute(&image, &class).unwrap();
    assert!((0.0..=1.0).contains(&report.confidence));
    assert_eq!(report.heatmap.shape(), (16, 3));
    assert_eq!(report.grid.tensor().dims(), &[4, 4]);

    // Scalar equals the global max of the selected rows.
    let expected = image
        .select_tokens(class.ids())
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .into_iter()
        .fold(f32::NEG_INFINITY, f32::max);
    assert!((report.confidence - expected).abs() < 1e-7);
}

// ---------------------------------------------------------------------------
// End-to-end
// ---------------------------------------------------------------------------

#[test]
fn retrieve_and_analyze_single_tile() {
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let state = state_with(Arc::clone(&recorded));
    let dir = tempfile::tempdir().unwrap();
    let img = write_image(dir.path(), "square.png", 64, 64);
    let opts = options();

    let report = retrieve_logit_lens(&state, &img, &opts).unwrap();
    assert_eq!(report.caption, "the cat on the mat");
    assert_eq!(report.num_tiles, 1);
    assert_eq!(report.span.len, 16);
    assert!(
        report.input_ids[report.span.range()]
            .iter()
            .all(|&id| id == IMG_CONTEXT)
    );
    assert_eq!(report.probabilities.tensor().dims(), &[1, 3, 16, VOCAB]);
    assert_rows_normalised(report.probabilities.tensor());

    {
        let rec = recorded.lock().unwrap();
        let cfg = rec.config.as_ref().unwrap();
        assert_eq!(cfg.eos_token_id, Some(IM_END));
        assert_eq!(cfg.max_new_tokens, 8);
        assert_eq!(cfg.num_beams, 1);
        assert_eq!(rec.tiles, Some(1));
        assert!(rec.mask.iter().all(|&m| m == 1));
        assert_eq!(rec.mask.len(), report.input_ids.len());
    }

    let scored = analyze_class(&state, &report, "cat", &opts).unwrap();
    assert_eq!(scored.class.ids(), &[CAT]);
    assert!((0.0..=1.0).contains(&scored.confidence));
    assert_eq!(scored.heatmap.shape(), (16, 3));
    assert_eq!(scored.grid.side(), 4);

    let grid_max = scored
        .grid
        .to_rows()
        .unwrap()
        .into_iter()
        .flatten()
        .fold(f32::NEG_INFINITY, f32::max);
    assert!((grid_max - scored.confidence).abs() < 1e-7);
}

#[test]
fn image_positions_match_logit_lens_of_prompt() {
    let state = state();
    let dir = tempfile::tempdir().unwrap();
    let img = write_image(dir.path(), "square.png", 40, 40);
    let report = retrieve_logit_lens(&state, &img, &options()).unwrap();

    // Layer 0 of an image position is the embedding of <IMG_CONTEXT>.
    let ctx = Tensor::new(&[IMG_CONTEXT], &Device::Cpu).unwrap();
    let logits = state.model().project_to_vocab(&state.model().embed_tokens(&ctx).unwrap()).unwrap();
    let expected = candle_nn::ops::softmax_last_dim(&logits)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    let got = report
        .probabilities
        .tensor()
        .i((0, 0, 7))
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    for (a, b) in expected.iter().zip(&got) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn two_tiles_give_non_square_grid() {
    let state = state();
    let dir = tempfile::tempdir().unwrap();
    let img = write_image(dir.path(), "wide.png", 64, 32);
    let mut opts = options();
    opts.tiling.max_tiles = 2;

    let report = retrieve_logit_lens(&state, &img, &opts).unwrap();
    assert_eq!(report.num_tiles, 2);
    assert_eq!(report.span.len, 32);
    let err = analyze_class(&state, &report, "cat", &opts).unwrap_err();
    assert!(matches!(err, LensError::Shape(_)));
}

#[test]
fn stray_context_token_is_an_alignment_error() {
    let state = state();
    let dir = tempfile::tempdir().unwrap();
    let img = write_image(dir.path(), "square.png", 32, 32);
    let mut opts = options();
    opts.text_prompt = "<IMG_CONTEXT> Describe <image>".into();

    let err = retrieve_logit_lens(&state, &img, &opts).unwrap_err();
    assert!(matches!(err, LensError::Alignment(_)), "{err}");
}

#[test]
fn unreadable_image_is_a_decode_error() {
    let state = state();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.jpg");
    std::fs::write(&path, b"\xff\xd8 not really").unwrap();
    let err = retrieve_logit_lens(&state, &path, &options()).unwrap_err();
    assert!(matches!(err, LensError::Decode(_)));
}

#[test]
fn caption_only_run_skips_hidden_states() {
    let state = state();
    let dir = tempfile::tempdir().unwrap();
    let img = write_image(dir.path(), "square.png", 32, 32);
    assert_eq!(caption_image(&state, &img, &options()).unwrap(), "the cat on the mat");
}

#[test]
fn strip_leading_policy_rejected_for_plain_tokenizer() {
    let state = state();
    let dir = tempfile::tempdir().unwrap();
    let img = write_image(dir.path(), "square.png", 32, 32);
    let mut opts = options();
    let report = retrieve_logit_lens(&state, &img, &opts).unwrap();
    opts.class_policy = SpecialTokenPolicy::StripLeading;
    assert!(matches!(
        analyze_class(&state, &report, "cat", &opts),
        Err(LensError::Tokenizer(_))
    ));
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

#[test]
fn hooks_run_while_registered() {
    let state = state();
    let dir = tempfile::tempdir().unwrap();
    let img = write_image(dir.path(), "square.png", 32, 32);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let handle = state
        .register_hook(1, move |point, _| {
            assert_eq!(point, &HookPoint::ResidPost(1));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();
    let counter = Arc::clone(&calls);
    let pre = state
        .register_pre_hook(0, move |_, _| {
            counter.fetch_add(10, Ordering::SeqCst);
            Ok(None)
        })
        .unwrap();

    retrieve_logit_lens(&state, &img, &options()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 11);

    drop(handle);
    pre.remove();
    assert!(state.model().hooks().is_empty());
    retrieve_logit_lens(&state, &img, &options()).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 11);
}

#[test]
fn hook_layer_out_of_range() {
    let state = state();
    let err = state.register_hook(DECODER_BLOCKS, |_, _| Ok(None)).unwrap_err();
    assert!(matches!(err, LensError::Hook(_)));
}

#[test]
fn replacing_hook_changes_probabilities() {
    let state = state();
    let dir = tempfile::tempdir().unwrap();
    let img = write_image(dir.path(), "square.png", 32, 32);
    let before = retrieve_logit_lens(&state, &img, &options()).unwrap();

    let _zero = state
        .register_hook(1, |_, t| Ok(Some(t.zeros_like()?)))
        .unwrap();
    let after = retrieve_logit_lens(&state, &img, &options()).unwrap();

    // Zeroed final block output projects to a uniform distribution.
    let last: Vec<f32> = after
        .probabilities
        .tensor()
        .i((0, 2, 0))
        .unwrap()
        .to_vec1()
        .unwrap();
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let uniform = 1.0 / VOCAB as f32;
    assert!(last.iter().all(|p| (p - uniform).abs() < 1e-6));
    // Earlier layers are untouched.
    let a: Vec<f32> = before.probabilities.tensor().i((0, 1)).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = after.probabilities.tensor().i((0, 1)).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(a, b);
}

// ---------------------------------------------------------------------------
// Hidden-layer text embedding
// ---------------------------------------------------------------------------

/// `io::Write` sink shared with a tracing subscriber.
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let out = tracing::subscriber::with_default(subscriber, f);
    (out, capture.text())
}

#[test]
fn hidden_layer_embedding_reads_requested_layer() {
    let state = state();
    let (emb, logs) = with_captured_logs(|| state.hidden_layer_embedding("tabby cat", 2).unwrap());
    assert_eq!(emb.dims(), &[1, HIDDEN]);
    assert!(!logs.contains("embedding validation failed"), "{logs}");

    // Two blocks of h * 0.5 + 1 applied to the embedding of "cat".
    let e = state.vocab_embeddings().i(usize::try_from(CAT).unwrap()).unwrap();
    let expected = e.affine(0.25, 1.5).unwrap().to_vec1::<f32>().unwrap();
    let got = emb.squeeze(0).unwrap().to_vec1::<f32>().unwrap();
    for (a, b) in expected.iter().zip(&got) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn hidden_layer_embedding_warns_on_embedding_mismatch() {
    let state = state();
    let _shift = state
        .model()
        .register_hook(HookPoint::Embed, |_, t| Ok(Some(t.affine(1.0, 1.0)?)));
    let (emb, logs) = with_captured_logs(|| state.hidden_layer_embedding("cat", 0).unwrap());
    assert_eq!(emb.dims(), &[1, HIDDEN]);
    assert!(logs.contains("embedding validation failed"), "{logs}");
}

#[test]
fn hidden_layer_embedding_rejects_bad_layer() {
    let state = state();
    assert!(matches!(
        state.hidden_layer_embedding("cat", DECODER_BLOCKS + 1),
        Err(LensError::Shape(_))
    ));
}

// ---------------------------------------------------------------------------
// State tables
// ---------------------------------------------------------------------------

#[test]
fn vocab_embeddings_indexed_by_token_id() {
    let state = state();
    assert_eq!(state.vocab_embeddings().dims(), &[VOCAB, HIDDEN]);
    let row: Vec<f32> = state.vocab_embeddings().i(5).unwrap().to_vec1().unwrap();
    let table: Vec<f32> = embedding_table().i(5).unwrap().to_vec1().unwrap();
    assert_eq!(row, table);
    assert_eq!(state.vocabulary().get("<IMG_CONTEXT>"), Some(&IMG_CONTEXT));
    assert_eq!(state.image_context_id().unwrap(), IMG_CONTEXT);
    assert_eq!(state.model_name(), "mock/InternVL-tiny");
}

#[test]
fn class_tokens_follow_tokenizer() {
    let state = state();
    let tokens = ClassTokens::resolve(state.tokenizer(), "tabby cat", SpecialTokenPolicy::Raw).unwrap();
    assert_eq!(tokens.ids(), &[3, CAT]);
    assert!(!state.tokenizer().adds_leading_special_token().unwrap());
}
