pub mod errors;
pub mod interpreter;

type FastHashMap<K, V> = rustc_hash::FxHashMap<K, V>;
type FastHashSet<K> = rustc_hash::FxHashSet<K>;
