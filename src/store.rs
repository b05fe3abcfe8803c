//! Per-session record store: primary id maps, secondary external-id and
//! title indexes, and the relationship adjacency index.
//!
//! Ownership model: the store owns every record; adjacency is a map
//! `entity_id -> {relationship_id}` owned here, never back-pointers inside
//! records. Deletes cascade (entity -> touching relationships + text-unit
//! unlinks, document -> its text-units) and are atomic from the caller's
//! perspective because the engine holds the session write guard throughout.

use std::collections::{HashMap, HashSet};

use crate::error::{GibramError, Result};
use crate::types::{
    normalize_title, Community, Document, DocumentStatus, Entity, MemoryCost, Relationship,
    TextUnit,
};

/// Records removed by a cascading delete; the engine uses this to update
/// counters, memory accounting, and the vector indexes.
#[derive(Debug, Default)]
pub struct CascadeReport {
    pub documents: Vec<Document>,
    pub text_units: Vec<TextUnit>,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub communities: Vec<Community>,
}

impl CascadeReport {
    pub fn freed_bytes(&self) -> u64 {
        let docs: usize = self.documents.iter().map(|r| r.memory_cost()).sum();
        let tus: usize = self.text_units.iter().map(|r| r.memory_cost()).sum();
        let ents: usize = self.entities.iter().map(|r| r.memory_cost()).sum();
        let rels: usize = self.relationships.iter().map(|r| r.memory_cost()).sum();
        let comms: usize = self.communities.iter().map(|r| r.memory_cost()).sum();
        (docs + tus + ents + rels + comms) as u64
    }
}

/// In-memory store for one session.
#[derive(Debug, Default)]
pub struct SessionStore {
    documents: HashMap<u64, Document>,
    text_units: HashMap<u64, TextUnit>,
    entities: HashMap<u64, Entity>,
    relationships: HashMap<u64, Relationship>,
    communities: HashMap<u64, Community>,

    doc_by_external: HashMap<String, u64>,
    tu_by_external: HashMap<String, u64>,
    entity_by_external: HashMap<String, u64>,
    rel_by_external: HashMap<String, u64>,
    community_by_external: HashMap<String, u64>,
    entity_by_title: HashMap<String, u64>,

    /// document id -> its text-unit ids
    doc_text_units: HashMap<u64, HashSet<u64>>,
    /// entity id -> relationship ids where the entity is the source
    outgoing: HashMap<u64, HashSet<u64>>,
    /// entity id -> relationship ids where the entity is the target
    incoming: HashMap<u64, HashSet<u64>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================================================================
    // Documents
    // ==================================================================

    pub fn insert_document(&mut self, doc: Document) -> Result<()> {
        if self.doc_by_external.contains_key(&doc.external_id) {
            return Err(GibramError::Conflict(format!(
                "document external id already exists: {}",
                doc.external_id
            )));
        }
        self.doc_by_external.insert(doc.external_id.clone(), doc.id);
        self.doc_text_units.entry(doc.id).or_default();
        self.documents.insert(doc.id, doc);
        Ok(())
    }

    /// Replay-path insert: an existing id is replaced instead of conflicting.
    pub fn upsert_document(&mut self, doc: Document) {
        if self.documents.contains_key(&doc.id) {
            let _ = self.delete_document(doc.id);
        }
        let _ = self.insert_document(doc);
    }

    pub fn document(&self, id: u64) -> Result<&Document> {
        self.documents
            .get(&id)
            .ok_or_else(|| GibramError::not_found("document", id))
    }

    pub fn document_by_external(&self, external_id: &str) -> Result<&Document> {
        let id = self
            .doc_by_external
            .get(external_id)
            .ok_or_else(|| GibramError::not_found("document", external_id))?;
        self.document(*id)
    }

    pub fn update_document_status(&mut self, id: u64, status: DocumentStatus) -> Result<()> {
        let doc = self
            .documents
            .get_mut(&id)
            .ok_or_else(|| GibramError::not_found("document", id))?;
        doc.status = status;
        Ok(())
    }

    /// Cascades into the document's text-units.
    pub fn delete_document(&mut self, id: u64) -> Result<CascadeReport> {
        let doc = self
            .documents
            .remove(&id)
            .ok_or_else(|| GibramError::not_found("document", id))?;
        self.doc_by_external.remove(&doc.external_id);

        let mut report = CascadeReport::default();
        if let Some(tu_ids) = self.doc_text_units.remove(&id) {
            let mut tu_ids: Vec<u64> = tu_ids.into_iter().collect();
            tu_ids.sort_unstable();
            for tu_id in tu_ids {
                if let Ok(sub) = self.delete_text_unit(tu_id) {
                    report.text_units.extend(sub.text_units);
                }
            }
        }
        report.documents.push(doc);
        Ok(report)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    // ==================================================================
    // Text units
    // ==================================================================

    pub fn insert_text_unit(&mut self, tu: TextUnit) -> Result<()> {
        if self.tu_by_external.contains_key(&tu.external_id) {
            return Err(GibramError::Conflict(format!(
                "text unit external id already exists: {}",
                tu.external_id
            )));
        }
        if !self.documents.contains_key(&tu.document_id) {
            return Err(GibramError::InvalidInput(format!(
                "text unit references unknown document: {}",
                tu.document_id
            )));
        }
        self.tu_by_external.insert(tu.external_id.clone(), tu.id);
        self.doc_text_units
            .entry(tu.document_id)
            .or_default()
            .insert(tu.id);
        // Restore-path records may arrive with links already populated.
        for &ent_id in &tu.entity_ids {
            if let Some(ent) = self.entities.get_mut(&ent_id) {
                ent.add_text_unit_id(tu.id);
            }
        }
        self.text_units.insert(tu.id, tu);
        Ok(())
    }

    pub fn upsert_text_unit(&mut self, tu: TextUnit) {
        if self.text_units.contains_key(&tu.id) {
            let _ = self.delete_text_unit(tu.id);
        }
        let _ = self.insert_text_unit(tu);
    }

    pub fn text_unit(&self, id: u64) -> Result<&TextUnit> {
        self.text_units
            .get(&id)
            .ok_or_else(|| GibramError::not_found("text unit", id))
    }

    pub fn text_unit_by_external(&self, external_id: &str) -> Result<&TextUnit> {
        let id = self
            .tu_by_external
            .get(external_id)
            .ok_or_else(|| GibramError::not_found("text unit", external_id))?;
        self.text_unit(*id)
    }

    pub fn delete_text_unit(&mut self, id: u64) -> Result<CascadeReport> {
        let tu = self
            .text_units
            .remove(&id)
            .ok_or_else(|| GibramError::not_found("text unit", id))?;
        self.tu_by_external.remove(&tu.external_id);
        if let Some(set) = self.doc_text_units.get_mut(&tu.document_id) {
            set.remove(&id);
        }
        for ent_id in &tu.entity_ids {
            if let Some(ent) = self.entities.get_mut(ent_id) {
                ent.remove_text_unit_id(id);
            }
        }
        let mut report = CascadeReport::default();
        report.text_units.push(tu);
        Ok(report)
    }

    pub fn text_units(&self) -> impl Iterator<Item = &TextUnit> {
        self.text_units.values()
    }

    pub fn text_unit_count(&self) -> usize {
        self.text_units.len()
    }

    // ==================================================================
    // Entities
    // ==================================================================

    pub fn insert_entity(&mut self, entity: Entity) -> Result<()> {
        if self.entity_by_external.contains_key(&entity.external_id) {
            return Err(GibramError::Conflict(format!(
                "entity external id already exists: {}",
                entity.external_id
            )));
        }
        let title_key = normalize_title(&entity.title);
        if self.entity_by_title.contains_key(&title_key) {
            return Err(GibramError::Conflict(format!(
                "entity title already exists: {}",
                entity.title
            )));
        }
        self.entity_by_external
            .insert(entity.external_id.clone(), entity.id);
        self.entity_by_title.insert(title_key, entity.id);
        self.outgoing.entry(entity.id).or_default();
        self.incoming.entry(entity.id).or_default();
        for &tu_id in &entity.text_unit_ids {
            if let Some(tu) = self.text_units.get_mut(&tu_id) {
                tu.add_entity_id(entity.id);
            }
        }
        self.entities.insert(entity.id, entity);
        Ok(())
    }

    pub fn upsert_entity(&mut self, entity: Entity) {
        if self.entities.contains_key(&entity.id) {
            let _ = self.delete_entity(entity.id);
        }
        let _ = self.insert_entity(entity);
    }

    pub fn entity(&self, id: u64) -> Result<&Entity> {
        self.entities
            .get(&id)
            .ok_or_else(|| GibramError::not_found("entity", id))
    }

    pub fn entity_by_external(&self, external_id: &str) -> Result<&Entity> {
        let id = self
            .entity_by_external
            .get(external_id)
            .ok_or_else(|| GibramError::not_found("entity", external_id))?;
        self.entity(*id)
    }

    pub fn entity_by_title(&self, title: &str) -> Option<&Entity> {
        self.entity_by_title
            .get(&normalize_title(title))
            .and_then(|id| self.entities.get(id))
    }

    pub fn update_entity_description(&mut self, id: u64, description: String) -> Result<()> {
        let ent = self
            .entities
            .get_mut(&id)
            .ok_or_else(|| GibramError::not_found("entity", id))?;
        ent.description = description;
        Ok(())
    }

    /// Cascades into every relationship touching the entity (both
    /// directions) and unlinks the entity from its text-units.
    pub fn delete_entity(&mut self, id: u64) -> Result<CascadeReport> {
        let entity = self
            .entities
            .remove(&id)
            .ok_or_else(|| GibramError::not_found("entity", id))?;
        self.entity_by_external.remove(&entity.external_id);
        self.entity_by_title.remove(&normalize_title(&entity.title));

        let mut touching: Vec<u64> = Vec::new();
        if let Some(out) = self.outgoing.remove(&id) {
            touching.extend(out);
        }
        if let Some(inc) = self.incoming.remove(&id) {
            touching.extend(inc);
        }
        touching.sort_unstable();
        touching.dedup();

        let mut report = CascadeReport::default();
        for rel_id in touching {
            if let Some(rel) = self.remove_relationship_record(rel_id) {
                report.relationships.push(rel);
            }
        }

        for tu_id in &entity.text_unit_ids {
            if let Some(tu) = self.text_units.get_mut(tu_id) {
                tu.remove_entity_id(id);
            }
        }

        report.entities.push(entity);
        Ok(report)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // ==================================================================
    // Relationships
    // ==================================================================

    pub fn insert_relationship(&mut self, rel: Relationship) -> Result<()> {
        if self.rel_by_external.contains_key(&rel.external_id) {
            return Err(GibramError::Conflict(format!(
                "relationship external id already exists: {}",
                rel.external_id
            )));
        }
        if !rel.weight.is_finite() || rel.weight < 0.0 {
            return Err(GibramError::InvalidInput(format!(
                "relationship weight must be finite and non-negative, got {}",
                rel.weight
            )));
        }
        if !self.entities.contains_key(&rel.source_id) {
            return Err(GibramError::InvalidInput(format!(
                "relationship source entity not found: {}",
                rel.source_id
            )));
        }
        if !self.entities.contains_key(&rel.target_id) {
            return Err(GibramError::InvalidInput(format!(
                "relationship target entity not found: {}",
                rel.target_id
            )));
        }
        self.rel_by_external.insert(rel.external_id.clone(), rel.id);
        self.outgoing.entry(rel.source_id).or_default().insert(rel.id);
        self.incoming.entry(rel.target_id).or_default().insert(rel.id);
        self.relationships.insert(rel.id, rel);
        Ok(())
    }

    pub fn upsert_relationship(&mut self, rel: Relationship) {
        if self.relationships.contains_key(&rel.id) {
            self.remove_relationship_record(rel.id);
        }
        let _ = self.insert_relationship(rel);
    }

    pub fn relationship(&self, id: u64) -> Result<&Relationship> {
        self.relationships
            .get(&id)
            .ok_or_else(|| GibramError::not_found("relationship", id))
    }

    pub fn relationship_by_external(&self, external_id: &str) -> Result<&Relationship> {
        let id = self
            .rel_by_external
            .get(external_id)
            .ok_or_else(|| GibramError::not_found("relationship", external_id))?;
        self.relationship(*id)
    }

    pub fn delete_relationship(&mut self, id: u64) -> Result<Relationship> {
        self.remove_relationship_record(id)
            .ok_or_else(|| GibramError::not_found("relationship", id))
    }

    fn remove_relationship_record(&mut self, id: u64) -> Option<Relationship> {
        let rel = self.relationships.remove(&id)?;
        self.rel_by_external.remove(&rel.external_id);
        if let Some(set) = self.outgoing.get_mut(&rel.source_id) {
            set.remove(&id);
        }
        if let Some(set) = self.incoming.get_mut(&rel.target_id) {
            set.remove(&id);
        }
        Some(rel)
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    /// Relationship ids incident to an entity, outgoing then incoming.
    pub fn neighbor_relationships(&self, entity_id: u64) -> Vec<u64> {
        let mut out: Vec<u64> = Vec::new();
        if let Some(set) = self.outgoing.get(&entity_id) {
            out.extend(set.iter().copied());
        }
        if let Some(set) = self.incoming.get(&entity_id) {
            out.extend(set.iter().copied());
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    // ==================================================================
    // Communities
    // ==================================================================

    pub fn insert_community(&mut self, community: Community) -> Result<()> {
        if self.community_by_external.contains_key(&community.external_id) {
            return Err(GibramError::Conflict(format!(
                "community external id already exists: {}",
                community.external_id
            )));
        }
        self.community_by_external
            .insert(community.external_id.clone(), community.id);
        self.communities.insert(community.id, community);
        Ok(())
    }

    pub fn upsert_community(&mut self, community: Community) {
        if let Some(old) = self.communities.remove(&community.id) {
            self.community_by_external.remove(&old.external_id);
        }
        let _ = self.insert_community(community);
    }

    pub fn community(&self, id: u64) -> Result<&Community> {
        self.communities
            .get(&id)
            .ok_or_else(|| GibramError::not_found("community", id))
    }

    pub fn delete_community(&mut self, id: u64) -> Result<Community> {
        let community = self
            .communities
            .remove(&id)
            .ok_or_else(|| GibramError::not_found("community", id))?;
        self.community_by_external.remove(&community.external_id);
        Ok(community)
    }

    /// Atomically replace the derived community set (regeneration).
    pub fn replace_communities(&mut self, communities: Vec<Community>) -> Vec<Community> {
        let old: Vec<Community> = self.communities.drain().map(|(_, c)| c).collect();
        self.community_by_external.clear();
        for c in communities {
            self.community_by_external.insert(c.external_id.clone(), c.id);
            self.communities.insert(c.id, c);
        }
        old
    }

    pub fn communities(&self) -> impl Iterator<Item = &Community> {
        self.communities.values()
    }

    pub fn community_count(&self) -> usize {
        self.communities.len()
    }

    // ==================================================================
    // Links
    // ==================================================================

    /// Create the two-way text-unit <-> entity link.
    pub fn link(&mut self, text_unit_id: u64, entity_id: u64) -> Result<()> {
        if !self.entities.contains_key(&entity_id) {
            return Err(GibramError::not_found("entity", entity_id));
        }
        match self.text_units.get_mut(&text_unit_id) {
            Some(tu) => tu.add_entity_id(entity_id),
            None => return Err(GibramError::not_found("text unit", text_unit_id)),
        }
        if let Some(ent) = self.entities.get_mut(&entity_id) {
            ent.add_text_unit_id(text_unit_id);
        }
        Ok(())
    }

    pub fn unlink(&mut self, text_unit_id: u64, entity_id: u64) -> Result<()> {
        if !self.entities.contains_key(&entity_id) {
            return Err(GibramError::not_found("entity", entity_id));
        }
        match self.text_units.get_mut(&text_unit_id) {
            Some(tu) => tu.remove_entity_id(entity_id),
            None => return Err(GibramError::not_found("text unit", text_unit_id)),
        }
        if let Some(ent) = self.entities.get_mut(&entity_id) {
            ent.remove_text_unit_id(text_unit_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Document, Entity, Relationship, TextUnit};

    fn store_with_graph() -> SessionStore {
        let mut store = SessionStore::new();
        store.insert_document(Document::new(1, "doc-1", "a.pdf")).unwrap();
        store
            .insert_text_unit(TextUnit::new(1, "chunk-1", 1, "alpha", 1))
            .unwrap();
        store
            .insert_entity(Entity::new(1, "ent-1", "ALPHA", "concept", ""))
            .unwrap();
        store
            .insert_entity(Entity::new(2, "ent-2", "BETA", "concept", ""))
            .unwrap();
        store
            .insert_relationship(Relationship::new(1, "rel-1", 1, 2, "REL", "", 0.9))
            .unwrap();
        store
    }

    #[test]
    fn duplicate_external_id_conflicts() {
        let mut store = SessionStore::new();
        store.insert_document(Document::new(1, "doc-1", "a.pdf")).unwrap();
        let err = store
            .insert_document(Document::new(2, "doc-1", "b.pdf"))
            .unwrap_err();
        assert!(matches!(err, GibramError::Conflict(_)));
    }

    #[test]
    fn duplicate_title_conflicts_case_insensitively() {
        let mut store = SessionStore::new();
        store
            .insert_entity(Entity::new(1, "ent-1", "Bank Indonesia", "org", ""))
            .unwrap();
        let err = store
            .insert_entity(Entity::new(2, "ent-2", "BANK INDONESIA", "org", ""))
            .unwrap_err();
        assert!(matches!(err, GibramError::Conflict(_)));
    }

    #[test]
    fn relationship_requires_existing_endpoints() {
        let mut store = SessionStore::new();
        store
            .insert_entity(Entity::new(1, "ent-1", "A", "t", ""))
            .unwrap();
        let err = store
            .insert_relationship(Relationship::new(1, "rel-1", 1, 99, "REL", "", 1.0))
            .unwrap_err();
        assert!(matches!(err, GibramError::InvalidInput(_)));
    }

    #[test]
    fn negative_weight_rejected() {
        let mut store = store_with_graph();
        let err = store
            .insert_relationship(Relationship::new(2, "rel-2", 1, 2, "REL", "", -0.5))
            .unwrap_err();
        assert!(matches!(err, GibramError::InvalidInput(_)));
    }

    #[test]
    fn entity_delete_cascades_relationships_and_unlinks() {
        let mut store = store_with_graph();
        store.link(1, 1).unwrap();

        let report = store.delete_entity(1).unwrap();
        assert_eq!(report.entities.len(), 1);
        assert_eq!(report.relationships.len(), 1);

        // No relationship references the deleted entity in either direction.
        assert!(store.relationships().all(|r| r.source_id != 1 && r.target_id != 1));
        assert!(store.neighbor_relationships(2).is_empty());
        // Text unit no longer lists the entity.
        assert!(store.text_unit(1).unwrap().entity_ids.is_empty());
    }

    #[test]
    fn document_delete_cascades_text_units() {
        let mut store = store_with_graph();
        store.link(1, 1).unwrap();

        let report = store.delete_document(1).unwrap();
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.text_units.len(), 1);
        assert!(store.text_units().next().is_none());
        // Entity survives but loses the provenance link.
        assert!(store.entity(1).unwrap().text_unit_ids.is_empty());
    }

    #[test]
    fn link_unlink_round_trip() {
        let mut store = store_with_graph();
        store.link(1, 2).unwrap();
        assert_eq!(store.text_unit(1).unwrap().entity_ids, vec![2]);
        assert_eq!(store.entity(2).unwrap().text_unit_ids, vec![1]);
        store.unlink(1, 2).unwrap();
        assert!(store.text_unit(1).unwrap().entity_ids.is_empty());
        assert!(store.entity(2).unwrap().text_unit_ids.is_empty());
    }

    #[test]
    fn replace_communities_is_atomic_swap() {
        let mut store = SessionStore::new();
        store
            .insert_community(Community::new(1, "comm-1", 0, vec![], vec![]))
            .unwrap();
        let old = store.replace_communities(vec![
            Community::new(2, "comm-2", 0, vec![], vec![]),
            Community::new(3, "comm-3", 1, vec![], vec![]),
        ]);
        assert_eq!(old.len(), 1);
        assert_eq!(store.community_count(), 2);
        assert!(store.community(1).is_err());
    }
}
