/// Data layer: core types, loading, filtering and encoding.
///
/// Architecture:
/// ```text
///  .pkl.gz / .json.gz
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  gunzip + decode → MnistArchive (train / val / test)
///   └──────────┘
///        │
///        ├──────────────────────┐
///        ▼                      ▼
///   ┌──────────┐          ┌──────────┐
///   │  filter   │ 0/1 only │  encode   │ one-hot, all digits
///   └──────────┘          └──────────┘
///        │                      │
///        ▼                      ▼
///     TaskData (x: 784×m, y: 1×m | 10×m)
/// ```

pub mod encode;
pub mod filter;
pub mod loader;
pub mod model;
pub mod pickle;
