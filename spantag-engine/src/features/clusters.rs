//! Brown cluster features: hierarchical cluster bit-string prefixes per form.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::codec::{self, Reader, Writer};
use crate::entity_map::EntityMap;
use crate::features::processor::{FeatureProcessor, KeyMap, WindowKind, apply_in_window};
use crate::features::{Feature, Pipeline, TemplateError, TemplateResult};
use crate::sentence::Sentence;

/// Loads a `cluster\tform` file and emits, for each form's cluster, one
/// feature per configured bit-string prefix (the whole cluster plus any
/// prefix lengths given as template arguments).
pub struct BrownClusters {
    /// Form → cluster index (reusing the key map storage).
    keys: KeyMap,
    /// Per cluster, the feature ids of its prefixes.
    clusters: Vec<Vec<Feature>>,
}

impl BrownClusters {
    pub fn new() -> Self {
        BrownClusters {
            keys: KeyMap::new(WindowKind::Symmetric),
            clusters: Vec::new(),
        }
    }
}

impl FeatureProcessor for BrownClusters {
    fn parse(
        &mut self,
        window: i32,
        args: &[String],
        _entities: &mut EntityMap,
        total: &AtomicU32,
        _pipeline: &Pipeline,
    ) -> TemplateResult<()> {
        self.keys.init(window, total);
        let Some(path) = args.first() else {
            return Err(TemplateError::Parse(
                "BrownClusters requires a cluster file as the first argument".to_string(),
            ));
        };

        // First prefix is the whole cluster string, then the configured lengths
        let mut prefix_lengths: Vec<Option<usize>> = vec![None];
        for arg in &args[1..] {
            let len: usize = arg.parse().map_err(|_| {
                TemplateError::Parse(format!("wrong prefix length '{arg}' in BrownClusters"))
            })?;
            if len == 0 {
                return Err(TemplateError::Parse(
                    "prefix lengths in BrownClusters must be positive".to_string(),
                ));
            }
            prefix_lengths.push(Some(len));
        }

        let file = File::open(path).map_err(|e| {
            TemplateError::Parse(format!("cannot open Brown clusters file '{path}': {e}"))
        })?;

        self.clusters.clear();
        let mut cluster_ids: HashMap<String, u32> = HashMap::new();
        let mut prefix_features: HashMap<String, Feature> = HashMap::new();
        let claim = 2 * window as u32 + 1;

        for line in BufReader::new(file).lines() {
            let line = line?;
            let Some((cluster, form)) = line.split_once('\t') else {
                return Err(TemplateError::Parse(format!(
                    "wrong line '{line}' in Brown clusters file '{path}'"
                )));
            };

            let cluster_id = match cluster_ids.get(cluster) {
                Some(&id) => id,
                None => {
                    let id = self.clusters.len() as u32;
                    let mut features = Vec::new();
                    for prefix_length in &prefix_lengths {
                        let prefix = match prefix_length {
                            None => cluster,
                            Some(len) if *len < cluster.len() => &cluster[..*len],
                            Some(_) => continue,
                        };
                        let feature = *prefix_features.entry(prefix.to_string()).or_insert_with(
                            || total.fetch_add(claim, Ordering::Relaxed) + window as u32,
                        );
                        features.push(feature);
                    }
                    self.clusters.push(features);
                    cluster_ids.insert(cluster.to_string(), id);
                    id
                }
            };

            if !self.keys.insert_raw(form.to_string(), cluster_id) {
                return Err(TemplateError::Parse(format!(
                    "form '{form}' is present twice in Brown clusters file '{path}'"
                )));
            }
        }

        Ok(())
    }

    fn load(&mut self, r: &mut Reader, _pipeline: &Pipeline) -> codec::Result<()> {
        self.keys.load(r)?;

        let count = r.next_u32()? as usize;
        self.clusters = Vec::with_capacity(count);
        for _ in 0..count {
            let len = r.next_u32()? as usize;
            let mut features = Vec::with_capacity(len);
            for _ in 0..len {
                features.push(r.next_u32()?);
            }
            self.clusters.push(features);
        }
        Ok(())
    }

    fn save(&self, w: &mut Writer) {
        self.keys.save(w);

        w.put_u32(self.clusters.len() as u32);
        for cluster in &self.clusters {
            w.put_u32(cluster.len() as u32);
            for &feature in cluster {
                w.put_u32(feature);
            }
        }
    }

    fn process_sentence(&self, sentence: &mut Sentence, _total: Option<&AtomicU32>, _buffer: &mut String) {
        let window = self.keys.window();
        for i in 0..sentence.size {
            let Some(cluster_id) = self.keys.get_raw(&sentence.words[i].raw_lemma) else {
                continue;
            };
            let Some(features) = self.clusters.get(cluster_id as usize) else {
                continue;
            };
            for &feature in features {
                apply_in_window(sentence, i as isize, Some(feature), window);
            }
        }
    }
}
