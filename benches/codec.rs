use std::hint::black_box;
use std::io::Cursor;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use ndarray::{Array1, Array3, ArrayD, IxDyn};
use ndarray_npy::NpzWriter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vqpress::codec::{Codebook, CodecConfig, VqCodec, parameter_shapes};

fn random_codec(config: CodecConfig) -> VqCodec {
    let mut rng = StdRng::seed_from_u64(0);
    let mut npz = NpzWriter::new(Cursor::new(Vec::new()));
    for (name, shape) in parameter_shapes(&config) {
        let array = ArrayD::from_shape_fn(IxDyn(&shape), |_| rng.random_range(-0.05..0.05f32));
        npz.add_array(name, &array).unwrap();
    }
    let mut codec = VqCodec::new(config);
    codec.try_load_from(Cursor::new(npz.finish().unwrap().into_inner())).unwrap();
    codec
}

fn benchmark_codebook(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let config = CodecConfig::default();
    let codebook = Codebook::new(ndarray::Array2::from_shape_fn((config.num_embeddings, config.embedding_dim), |_| {
        rng.random::<f32>()
    }));
    let v = Array1::from_shape_fn(config.embedding_dim, |_| rng.random::<f32>());

    let mut group = c.benchmark_group("码本");
    group.throughput(Throughput::Elements(1));
    group.bench_function("最近邻 1024x256", |b| b.iter(|| codebook.nearest(black_box(v.view()))));
    group.finish();
}

fn benchmark_forward(c: &mut Criterion) {
    let config = CodecConfig::default();
    let codec = random_codec(config);
    let r = config.resolution;
    let x = Array3::from_shape_fn((3, r, r), |(c, y, x)| ((c * 31 + y * 7 + x) % 255) as f32 / 127.5 - 1.0);
    let encoded = codec.encode(x.view()).unwrap();

    let mut group = c.benchmark_group("VQ 编解码器");
    group.sample_size(10);
    group.throughput(Throughput::Elements(1));
    group.bench_function("编码", |b| b.iter(|| codec.encode(black_box(x.view())).unwrap()));
    group.bench_function("解码", |b| b.iter(|| codec.decode(black_box(encoded.quantized.view())).unwrap()));
    group.bench_function("前向", |b| b.iter(|| codec.forward(black_box(x.view())).unwrap()));
    group.finish();
}

criterion_group!(benches, benchmark_codebook, benchmark_forward);
criterion_main!(benches);
