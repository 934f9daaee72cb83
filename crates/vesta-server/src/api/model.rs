// Query parameters of the GET endpoints

use serde::Deserialize;

use vesta_persistence::ConfigFileKey;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileParam {
    pub namespace: String,
    pub group: String,
    pub file_name: String,
}

impl FileParam {
    pub fn file(&self) -> ConfigFileKey {
        ConfigFileKey::new(&self.namespace, &self.group, &self.file_name)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NamespaceParam {
    pub namespace: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientParam {
    pub client_id: String,
}
