use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type StepId = String;

#[derive(Debug, Clone)]
pub struct Step {
    pub id: StepId,
    pub label: String,
    pub stage: String,
    pub phase: String,
    /// Step ids or provided tokens; a trailing `?` makes the edge optional.
    pub after: Vec<StepId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Pipeline {
    steps: BTreeMap<StepId, Step>,
}

impl Pipeline {
    pub fn add(&mut self, step: Step) -> Result<()> {
        if self.steps.contains_key(&step.id) {
            return Err(Error::msg(format!("duplicate step id '{}'", step.id)));
        }
        self.steps.insert(step.id.clone(), step);
        Ok(())
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, step) in &self.steps {
            for p in &step.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{p}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }
        Ok(out)
    }

    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if let Some((id, _)) = self.steps.get_key_value(dep) {
            return Ok(Some(id.as_str()));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            Ok(None)
        } else {
            Err(Error::msg(format!("unknown dependency '{dep}'")))
        }
    }

    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let provides = self.provides_index()?;
        let mut out = Vec::new();
        for (id, step) in &self.steps {
            for dep in &step.after {
                let resolved = self.resolve_dep(&provides, dep).map_err(|e| {
                    Error::msg(format!("step '{id}' has invalid dependency '{dep}': {e}"))
                })?;
                if let Some(dep_id) = resolved {
                    out.push((dep_id, id.as_str()));
                }
            }
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn ordered(&self) -> Result<Vec<&Step>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.steps.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (from, to) in self.edges()? {
            if outgoing.entry(from).or_default().insert(to) {
                *incoming.entry(to).or_default() += 1;
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Step> = Vec::with_capacity(self.steps.len());

        while let Some(n) = q.pop_front() {
            if let Some(step) = self.steps.get(n) {
                out.push(step);
            }
            for &m in outgoing.get(n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.steps.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "step graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph install {\n  rankdir=LR;\n");
        for step in self.steps.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                step.id, step.label, step.stage, step.phase
            ));
        }
        for (from, to) in self.edges()? {
            out.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, after: &[&str], provides: &[&str]) -> Step {
        Step {
            id: id.into(),
            label: id.into(),
            stage: "t".into(),
            phase: "p".into(),
            after: after.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn orders_by_ids_and_tokens() {
        let mut p = Pipeline::default();
        p.add(step("c", &["disk:ready"], &[])).expect("c");
        p.add(step("b", &["a", "missing?"], &["disk:ready"])).expect("b");
        p.add(step("a", &[], &[])).expect("a");
        let ids: Vec<_> = p.ordered().expect("order").iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn rejects_cycles_and_unknown_deps() {
        let mut p = Pipeline::default();
        p.add(step("a", &["b"], &[])).expect("a");
        p.add(step("b", &["a"], &[])).expect("b");
        assert!(p.ordered().is_err());

        let mut q = Pipeline::default();
        q.add(step("a", &["nope"], &[])).expect("a");
        assert!(q.ordered().is_err());
        assert!(q.add(step("a", &[], &[])).is_err());
    }
}
