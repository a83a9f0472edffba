use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lmcrf_core::{Batcher, Crf, Instance, LabelSpace, PackedInstance, PadTokens};

const LABELS: usize = 9;

fn pads() -> PadTokens {
    PadTokens {
        flm_pad: 0,
        blm_pad: 0,
        word_pad: 0,
        char_separator: 1,
        char_pad: 2,
        label_start: LABELS as u32,
        label_pad: LABELS as u32 + 1,
        label_size: LABELS as u32 + 2,
    }
}

/// Sentences of 5 to 35 words, each word 2 to 9 characters long.
fn corpus(size: usize) -> Vec<PackedInstance> {
    let mut rng = oorandom::Rand32::new(7);
    (0..size)
        .map(|_| {
            let words = rng.rand_range(5..36) as usize;
            let ids: Vec<u32> = (0..words).map(|_| rng.rand_range(3..5000)).collect();
            Instance {
                flm_words: ids.clone(),
                blm_words: ids.clone(),
                words: ids,
                chars: (0..words)
                    .map(|_| (0..rng.rand_range(2..10)).map(|_| rng.rand_range(3..90)).collect())
                    .collect(),
                labels: (0..words).map(|_| rng.rand_range(0..LABELS as u32)).collect(),
            }
            .pack(1)
        })
        .collect()
}

fn bench_batch_assembly(c: &mut Criterion) {
    let batcher = Batcher::new(pads(), Device::Cpu).unwrap();
    let instances = corpus(64);
    let refs: Vec<&PackedInstance> = instances.iter().collect();

    c.bench_function("assemble_batch_10", |b| {
        b.iter(|| batcher.assemble(black_box(&refs[..10])).unwrap());
    });

    c.bench_function("assemble_batch_64_to_tensors", |b| {
        b.iter(|| batcher.batch(black_box(&refs)).unwrap());
    });
}

fn bench_viterbi(c: &mut Criterion) {
    let labels = LabelSpace::new(LABELS).unwrap();
    let crf = Crf::new(labels, &Device::Cpu).unwrap();
    let batcher = Batcher::new(pads(), Device::Cpu).unwrap();
    let instances = corpus(16);
    let refs: Vec<&PackedInstance> = instances.iter().collect();
    let batch = batcher.batch(&refs).unwrap();

    let (rows, size) = (batch.words.dim(0).unwrap(), labels.tagset_size());
    let emissions = Tensor::randn(0f32, 1.0, (rows, refs.len(), size), &Device::Cpu).unwrap();

    c.bench_function("viterbi_decode_16", |b| {
        b.iter(|| crf.decode(black_box(&emissions), &batch.mask).unwrap());
    });

    c.bench_function("crf_loss_16", |b| {
        b.iter(|| {
            crf.loss(black_box(&emissions), &batch.transitions, &batch.mask)
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_batch_assembly, bench_viterbi);
criterion_main!(benches);
