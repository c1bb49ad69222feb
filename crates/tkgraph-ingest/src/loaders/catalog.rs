//! Entity catalog for the parliamentary open-data API
//!
//! Specs are listed in dependency order: reference data first, then the
//! entities that link to it.

use std::sync::Arc;

use super::{EntityLoader, EntitySpec, RelationDescriptor as Rel};
use crate::error::Result;
use crate::framework::{LoaderRegistry, RetryPolicy};
use crate::source::DataSource;

pub fn entity_specs() -> Vec<EntitySpec> {
    vec![
        EntitySpec::new("personen", "Members of parliament and their careers", "Persoon", "Persoon", "id")
            .relation(Rel::expanded("PersoonLoopbaan", "PersoonLoopbaan", "HAS_CAREER", "id"))
            .relation(Rel::expanded("PersoonOnderwijs", "PersoonOnderwijs", "HAS_EDUCATION", "id"))
            .relation(Rel::expanded("PersoonNevenfunctie", "PersoonNevenfunctie", "HAS_SIDEPOSITION", "id")),
        EntitySpec::new("fracties", "Parliamentary groups and their seats", "Fractie", "Fractie", "id")
            .relation(Rel::expanded("FractieZetel", "FractieZetel", "HAS_ZETEL", "id")),
        EntitySpec::new("commissies", "Committees and their seats", "Commissie", "Commissie", "id")
            .relation(Rel::expanded("CommissieZetel", "CommissieZetel", "HAS_ZETEL", "id")),
        EntitySpec::new("persoon_functies", "Functions held by members", "PersoonFunctie", "PersoonFunctie", "id")
            .depends_on("personen")
            .depends_on("fracties")
            .relation(Rel::expanded("Persoon", "Persoon", "PERSON_HAS_FUNCTION", "id"))
            .relation(Rel::expanded("Fractie", "Fractie", "FUNCTION_FOR_FRACTIE", "id")),
        EntitySpec::new("zalen", "Meeting rooms", "Zaal", "Zaal", "id"),
        EntitySpec::new("reserveringen", "Room reservations", "Reservering", "Reservering", "id")
            .depends_on("zalen")
            .relation(Rel::expanded("Zaal", "Zaal", "RESERVES_ZAAL", "id")),
        EntitySpec::new("vergaderingen", "Plenary and committee meetings", "Vergadering", "Vergadering", "id")
            .date_field("Datum"),
        EntitySpec::new("activiteiten", "Parliamentary activities", "Activiteit", "Activiteit", "id")
            .date_field("Datum")
            .depends_on("commissies")
            .depends_on("reserveringen")
            .relation(Rel::expanded("Zaal", "Zaal", "HAS_ZAAL", "id"))
            .relation(Rel::expanded("Reservering", "Reservering", "HAS_RESERVERING", "id"))
            .relation(Rel::expanded("Voortouwcommissie", "Commissie", "HAS_VOORTOUWCOMMISSIE", "id"))
            .relation(Rel::expanded("Agendapunt", "Agendapunt", "HAS_AGENDAPUNT", "id"))
            .relation(Rel::navigation("ActiviteitActor", "ActiviteitActor", "HAS_ACT_ACTOR", "id")),
        EntitySpec::new("zaken", "Cases: bills, motions, questions", "Zaak", "Zaak", "nummer")
            .date_field("GestartOp")
            .depends_on("activiteiten")
            .relation(Rel::expanded("Document", "Document", "HAS_DOCUMENT", "id"))
            .relation(Rel::expanded("Agendapunt", "Agendapunt", "HAS_AGENDAPUNT", "id"))
            .relation(Rel::expanded("Activiteit", "Activiteit", "HAS_ACTIVITEIT", "id"))
            .relation(Rel::expanded("Besluit", "Besluit", "HAS_BESLUIT", "id"))
            .relation(Rel::expanded("ZaakActor", "ZaakActor", "HAS_ACTOR", "id"))
            .relation(Rel::expanded("Kamerstukdossier", "Dossier", "HAS_DOSSIER", "id"))
            .relation(Rel::navigation("VervangenDoor", "Zaak", "REPLACED_BY", "nummer")),
        EntitySpec::new("documenten", "Parliamentary documents", "Document", "Document", "id")
            .date_field("Datum")
            .depends_on("zaken")
            .relation(Rel::expanded("Zaak", "Zaak", "REFERS_TO_ZAAK", "nummer"))
            .relation(Rel::expanded("Activiteit", "Activiteit", "HAS_ACTIVITEIT", "id"))
            .relation(Rel::expanded("DocumentActor", "DocumentActor", "HAS_ACTOR", "id"))
            .relation(Rel::expanded("Kamerstukdossier", "Dossier", "HAS_DOSSIER", "id"))
            .relation(Rel::navigation("DocumentVersie", "DocumentVersie", "HAS_VERSIE", "id")),
        EntitySpec::new("kamerstukdossiers", "Document dossiers", "Kamerstukdossier", "Dossier", "id")
            .depends_on("documenten")
            .relation(Rel::expanded("Document", "Document", "CONTAINS_DOCUMENT", "id"))
            .relation(Rel::expanded("Zaak", "Zaak", "CONTAINS_ZAAK", "nummer")),
        EntitySpec::new("toezeggingen", "Commitments made by ministers", "Toezegging", "Toezegging", "id")
            .date_field("GewijzigdOp")
            .depends_on("activiteiten")
            .relation(Rel::expanded("Activiteit", "Activiteit", "MADE_DURING", "id")),
    ]
}

/// Registry with one [`EntityLoader`] per catalog entry
pub fn default_registry(source: Arc<dyn DataSource>, retry: RetryPolicy) -> Result<LoaderRegistry> {
    let mut registry = LoaderRegistry::new();
    for spec in entity_specs() {
        registry.register(Arc::new(EntityLoader::new(spec, source.clone(), retry.clone())))?;
    }
    Ok(registry)
}
