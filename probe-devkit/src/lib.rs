/*!
# Probe DevKit - Sonde simulée et utilitaires de test

Bibliothèque facilitant les tests du hub de température avec:
- Une sonde HTTP simulée (provisioning + lecture CSV)
- Des builders de payloads d'ingestion
- Un répertoire de données temporaire
*/

pub mod probe_stub;
pub mod test_utils;

pub use probe_stub::ProbeStub;
pub use test_utils::{ReadingPayload, TempStore};
