use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::config::ConfigError;

/// FoodSeg103 labels; id 0 is background.
pub const FOODSEG103_CLASSES: [&str; 104] = [
    "background",
    "candy",
    "egg tart",
    "french fries",
    "chocolate",
    "biscuit",
    "popcorn",
    "pudding",
    "ice cream",
    "cheese butter",
    "cake",
    "wine",
    "milkshake",
    "coffee",
    "juice",
    "milk",
    "tea",
    "almond",
    "red beans",
    "cashew",
    "dried cranberries",
    "soy",
    "walnut",
    "peanut",
    "egg",
    "apple",
    "date",
    "apricot",
    "avocado",
    "banana",
    "strawberry",
    "cherry",
    "blueberry",
    "raspberry",
    "mango",
    "olives",
    "peach",
    "lemon",
    "pear",
    "fig",
    "pineapple",
    "grape",
    "kiwi",
    "melon",
    "orange",
    "watermelon",
    "steak",
    "pork",
    "chicken duck",
    "sausage",
    "fried meat",
    "lamb",
    "sauce",
    "crab",
    "fish",
    "shellfish",
    "shrimp",
    "soup",
    "bread",
    "corn",
    "hamburg",
    "pizza",
    "hanamaki baozi",
    "wonton dumplings",
    "pasta",
    "noodles",
    "rice",
    "pie",
    "tofu",
    "eggplant",
    "potato",
    "garlic",
    "cauliflower",
    "tomato",
    "kelp",
    "seaweed",
    "spring onion",
    "rape",
    "ginger",
    "okra",
    "lettuce",
    "pumpkin",
    "cucumber",
    "white radish",
    "carrot",
    "asparagus",
    "bamboo shoots",
    "broccoli",
    "celery stick",
    "cilantro mint",
    "snow peas",
    "cabbage",
    "bean sprouts",
    "onion",
    "pepper",
    "green beans",
    "French beans",
    "king oyster mushroom",
    "shiitake",
    "enoki mushroom",
    "oyster mushroom",
    "white button mushroom",
    "salad",
    "other ingredients",
];

/// Class id to human-readable name table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNames {
    names: Vec<String>,
}

impl Default for ClassNames {
    fn default() -> Self {
        Self::foodseg103()
    }
}

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn foodseg103() -> Self {
        Self::new(FOODSEG103_CLASSES.iter().map(|s| (*s).to_string()).collect())
    }

    /// Loads an `id2label` JSON object such as `{"0": "background", "1": "candy"}`.
    ///
    /// Ids must be contiguous from zero.
    pub fn from_id2label_json(json: &str) -> Result<Self, ConfigError> {
        #[derive(Deserialize)]
        #[serde(transparent)]
        struct Id2Label(BTreeMap<String, String>);

        let Id2Label(raw) =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut by_id = BTreeMap::new();
        for (key, name) in raw {
            let id: usize = key
                .trim()
                .parse()
                .map_err(|_| ConfigError::Parse(format!("class id {key:?} is not an integer")))?;
            by_id.insert(id, name);
        }

        let mut names = Vec::with_capacity(by_id.len());
        for (expected, (id, name)) in by_id.into_iter().enumerate() {
            if id != expected {
                return Err(ConfigError::Parse(format!(
                    "class ids are not contiguous: missing id {expected}"
                )));
            }
            names.push(name);
        }

        Ok(Self::new(names))
    }

    pub fn from_id2label_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_id2label_json(&json)
    }

    /// Falls back to the decimal id for ids outside the table.
    pub fn name(&self, class_id: u32) -> String {
        self.names
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| class_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
